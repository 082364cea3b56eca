use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parsing rule groups")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid rule group: {0}")]
    InvalidGroup(String),
    #[error("invalid duration {0:?}")]
    Duration(String),
    #[error("invalid label selector {input:?}: {reason}")]
    Selector { input: String, reason: String },
}

/// Ordered collection of errors from a loop that must not stop at the first failure.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> Default for MultiError<E> {
    fn default() -> Self { Self { errors: Vec::new() } }
}

impl<E> MultiError<E> {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, err: E) { self.errors.push(err); }

    pub fn len(&self) -> usize { self.errors.len() }
    pub fn is_empty(&self) -> bool { self.errors.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, E> { self.errors.iter() }
    pub fn into_inner(self) -> Vec<E> { self.errors }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl<E> Extend<E> for MultiError<E> {
    fn extend<I: IntoIterator<Item = E>>(&mut self, iter: I) { self.errors.extend(iter); }
}

impl<E> FromIterator<E> for MultiError<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self { Self { errors: iter.into_iter().collect() } }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => f.write_str("no errors"),
            1 => write!(f, "1 error occurred: {}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred: ", n)?;
                for (i, e) in self.errors.iter().enumerate() {
                    if i > 0 { f.write_str("; ")?; }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}
