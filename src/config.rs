//! Restructuring configuration
//!
//! Tunables recognized by the core. Defaults reproduce the behavior of the
//! pipeline with no configuration file at all.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Knobs for the restructuring pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestructureConfig {
    /// Untangle threshold: split an arm only when
    /// `combing_cost > factor * untangling_cost`. Must be at least 1.
    pub untangle_multiplicative_factor: u32,

    /// When the two untangle costs tie, duplicate the else arm.
    pub untangle_prefer_else_on_tie: bool,

    /// Hard ceiling on inflate cloning; `None` is unlimited. On breach the
    /// region is rejected with `BudgetExceeded`.
    pub inflate_max_duplications: Option<usize>,

    /// Write a GraphViz dump per pass phase.
    pub dump_dots: bool,

    /// Where dot dumps go; directories are created on demand.
    pub dot_directory: PathBuf,

    /// Optional `tracing` target gating the structured pass logs.
    pub log_channel: Option<String>,
}

impl Default for RestructureConfig {
    fn default() -> Self {
        Self {
            untangle_multiplicative_factor: 1,
            untangle_prefer_else_on_tie: true,
            inflate_max_duplications: None,
            dump_dots: false,
            dot_directory: PathBuf::from("dots"),
            log_channel: None,
        }
    }
}

impl RestructureConfig {
    /// Clamp out-of-range values instead of failing: a factor below 1 makes
    /// the untangle criterion meaningless.
    pub fn sanitized(mut self) -> Self {
        if self.untangle_multiplicative_factor < 1 {
            self.untangle_multiplicative_factor = 1;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RestructureConfig::default();
        assert_eq!(config.untangle_multiplicative_factor, 1);
        assert!(config.untangle_prefer_else_on_tie);
        assert_eq!(config.inflate_max_duplications, None);
        assert!(!config.dump_dots);
    }

    #[test]
    fn sanitize_clamps_zero_factor() {
        let config = RestructureConfig {
            untangle_multiplicative_factor: 0,
            ..Default::default()
        };
        assert_eq!(config.sanitized().untangle_multiplicative_factor, 1);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: RestructureConfig =
            serde_json::from_str(r#"{"untangle_multiplicative_factor": 3}"#).unwrap();
        assert_eq!(config.untangle_multiplicative_factor, 3);
        assert_eq!(config.inflate_max_duplications, None);
    }
}
