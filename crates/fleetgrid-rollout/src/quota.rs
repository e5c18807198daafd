//! Count-based quota checks.

use tracing::warn;

use crate::error::{DeploymentError, DeploymentResult};

pub const TARGETS_PER_MANUAL_ASSIGNMENT: &str = "targets per manual assignment";

/// Fail with [`DeploymentError::QuotaExceeded`] when `requested > limit`.
pub fn check_count(resource: &'static str, requested: usize, limit: usize) -> DeploymentResult<()> {
    if requested > limit {
        warn!(resource, requested, limit, "quota exceeded");
        return Err(DeploymentError::QuotaExceeded {
            resource,
            requested,
            limit,
        });
    }
    Ok(())
}
