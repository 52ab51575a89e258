//! # Syncable Chart Optimizer
//!
//! A Helm chart optimization and safe-fix engine. It checks charts against a
//! catalog of resource, probe, availability and security rules, generates
//! values fixes, verifies them by re-rendering the chart, and writes them
//! back atomically without disturbing the formatting of `values.yaml`.
//!
//! ## Features
//!
//! - **Two evaluation modes**: raw values or fully rendered manifests
//! - **Render-verified fixes**: before/after renders decide whether a fix works
//! - **Atomic apply**: multi-file bundles commit all-or-nothing under a per-chart lock
//! - **Format preservation**: untouched `values.yaml` content stays byte-identical
//! - **Impact estimation**: fleet totals, node counts and monthly cost deltas
//!
//! ## Example
//!
//! ```rust,no_run
//! use syncable_chart_optimizer::analyzer::helm_optimize::{OptimizerConfig, RuleEngine, parse_chart_dir};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chart = parse_chart_dir(Path::new("./charts/api"))?;
//! let engine = RuleEngine::new(OptimizerConfig::default());
//! for violation in engine.check_chart(&chart)? {
//!     println!("{} {}: {}", violation.rule_id, violation.chart_name, violation.message);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod common;
pub mod config;
pub mod error;

// Re-export commonly used types and functions
pub use analyzer::helm_optimize::{
    Chart, OptimizerConfig, PatchBundle, RuleEngine, VerificationStatus, Violation, compute_impact,
    parse_chart_dir,
};
pub use error::{OptimizerError, Result};

/// The current version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging at a verbosity level.
///
/// 0 = warn, 1 = info, 2 = debug, 3+ = trace. `RUST_LOG` still applies to
/// modules it names. Safe to call more than once.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}
