use metrics::counter;
use rulesync_core::{DiffKind, MultiError, RuleGroupDiff};
use rulesync_ruler::{RulerClient, RulerError};
use tracing::{debug, warn};

use crate::Error;

/// One ruler call that failed while applying a diff.
#[derive(Debug, thiserror::Error)]
#[error("{op} rule group {namespace}/{group}: {source}")]
pub struct OpError {
    pub op: DiffKind,
    pub namespace: String,
    pub group: String,
    #[source]
    pub source: RulerError,
}

/// Execute `diffs` against the ruler in order. A failed call does not stop
/// the remaining ones; all failures are returned together.
pub async fn apply_changes(client: &dyn RulerClient, namespace: &str, diffs: &[RuleGroupDiff]) -> Result<(), Error> {
    let mut errs = MultiError::new();
    for diff in diffs {
        let op = diff.kind();
        let res = match diff {
            RuleGroupDiff::Add { desired } | RuleGroupDiff::Update { desired, .. } => {
                client.create_rule_group(namespace, desired).await
            }
            RuleGroupDiff::Remove { actual } => client.delete_rule_group(namespace, &actual.name).await,
        };
        match res {
            Ok(()) => {
                counter!("rulesync_ruler_ops_total", 1, "op" => op.as_str(), "result" => "ok");
                debug!(ns = %namespace, group = %diff.group_name(), op = op.as_str(), "applied");
            }
            Err(source) => {
                counter!("rulesync_ruler_ops_total", 1, "op" => op.as_str(), "result" => "error");
                warn!(ns = %namespace, group = %diff.group_name(), op = op.as_str(), error = %source, "apply failed");
                errs.push(OpError { op, namespace: namespace.to_string(), group: diff.group_name().to_string(), source });
            }
        }
    }
    errs.into_result().map_err(Error::Apply)
}

