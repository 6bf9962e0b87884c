//! Entity-reconciliation engine: per-run identity caches, find-or-create
//! resolvers, the five-phase orchestrator, and the post-associate invariant
//! repair.

use std::path::PathBuf;
use std::time::Duration;

pub mod context;
pub mod phases;
pub mod repair;
pub mod resolvers;
pub mod sink;

pub use context::ImportContext;
pub use phases::{ImportEngine, ImportRunReport};
pub use resolvers::{Resolved, ResolutionError};
pub use sink::BadRowSink;

pub const CRATE_NAME: &str = "teim-sync";

#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Minimum short/long length ratio for the center containment heuristic.
    /// Source-observed constant; kept configurable pending product-owner
    /// confirmation.
    pub containment_min_ratio: f64,
    /// Backoff before the single retry of a failed course/group creation.
    pub create_retry_delay: Duration,
    /// Append-only diagnostic CSV for rows that could not be processed.
    /// Disabled when unset.
    pub bad_rows_path: Option<PathBuf>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            containment_min_ratio: 0.70,
            create_retry_delay: Duration::from_millis(200),
            bad_rows_path: None,
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            containment_min_ratio: std::env::var("TEIM_CONTAINMENT_MIN_RATIO")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.containment_min_ratio),
            create_retry_delay: std::env::var("TEIM_CREATE_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.create_retry_delay),
            bad_rows_path: std::env::var("TEIM_BAD_ROWS_PATH").ok().map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_observed_import_rules() {
        let config = ImportConfig::default();
        assert!((config.containment_min_ratio - 0.70).abs() < f64::EPSILON);
        assert!(config.bad_rows_path.is_none());
    }
}
