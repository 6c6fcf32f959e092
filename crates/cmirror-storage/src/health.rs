//! Remote store reachability check

use anyhow::Result;
use opendal::Operator;

/// Succeeds when the remote root can be listed.
///
/// Used at startup (logged, never fatal) and by the daemon's `/readyz`.
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("remote root not listable: {e}"))
}
