//! Helm Chart Optimization and Safe-Fix Engine
//!
//! Evaluates a catalog of configuration rules against Helm charts, generates
//! values fixes, verifies them by re-rendering the chart, and commits them
//! atomically. A separate calculator estimates the fleet-wide resource and
//! cost impact of the fixes.
//!
//! # Pipeline
//!
//! Parser → Rule Engine (values or rendered manifests) → Violations →
//! Fix Generator → Verification Pipeline → Atomic Patch Applier.
//!
//! # Example
//!
//! ```rust,ignore
//! use syncable_chart_optimizer::analyzer::helm_optimize::{
//!     CatalogFixGenerator, FixGenerator, OptimizerConfig, RuleEngine, VerificationPipeline, VerificationStatus,
//!     apply_full_fix_bundle_atomic, parse_chart_dir,
//! };
//! use std::path::Path;
//!
//! let chart = parse_chart_dir(Path::new("./charts/api"))?;
//! let engine = RuleEngine::new(OptimizerConfig::default());
//! let violations = engine.check_chart(&chart)?;
//!
//! let generator = CatalogFixGenerator::new(engine.config().clone());
//! let pipeline = VerificationPipeline::new(&engine);
//! for violation in &violations {
//!     if let Some(bundle) = generator.generate_fix(&chart, violation) {
//!         let result = pipeline.verify_full_fix_bundle_preview(&chart, std::slice::from_ref(violation), &bundle);
//!         if result.status == VerificationStatus::Verified {
//!             apply_full_fix_bundle_atomic(&chart, &bundle)?;
//!         }
//!     }
//! }
//! ```
//!
//! # Rules
//!
//! ## Resources
//! - RES001/RES002: missing CPU/memory request
//! - RES003/RES004: missing CPU/memory limit
//! - RES005/RES006: excessive CPU/memory limit-to-request ratio
//! - RES007: BestEffort QoS
//!
//! ## Probes
//! - PRB001/PRB002: missing liveness/readiness probe
//!
//! ## Availability
//! - AVL001: single replica
//! - AVL002: no PodDisruptionBudget
//! - AVL003: no anti-affinity or topology spread
//! - AVL004: no priority class
//!
//! ## Security
//! - SEC001: runAsNonRoot not set
//! - SEC002: privileged container

/// Configuration for the optimizer.
pub mod config;

/// Core data types.
pub mod types;

/// Chart and values parsing.
pub mod parser;

/// Annotation-based rule ignoring (pragma).
pub mod pragma;

/// Chart rendering and rendered-manifest mapping.
pub mod render;

/// Rule catalog.
pub mod rules;

/// Rule evaluation over charts.
pub mod engine;

/// Fix generation.
pub mod fix;

/// Format-preserving values.yaml patching.
pub mod values_patcher;

/// Fix verification by re-rendering.
pub mod verify;

/// Atomic patch application.
pub mod apply;

/// Fleet resource and cost impact.
pub mod impact;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use apply::{
    ApplyResult, ApplyStrategy, StagedApplyOptions, apply_full_fix_bundle_atomic,
    apply_full_fix_bundle_via_staged_replace,
};
pub use config::{AnalysisMode, OptimizerConfig};
pub use engine::{ProgressCallback, RuleEngine};
pub use fix::{CatalogFixGenerator, FixGenerator, combine_fixes};
pub use impact::{
    ImpactOptions, ImpactResult, InstanceType, LiveReplicaMap, NodeInfo, TeamResolver, compute_impact,
};
pub use parser::{parse_chart, parse_chart_dir, parse_release_values};
pub use render::{HelmRenderer, ManifestRenderer, RenderOutcome, RenderRequest, RenderStatus, RenderValues};
pub use rules::{Rule, RuleInput, all_rules, find_rule};
pub use types::{
    AnalysisSource, Chart, ChartSource, PatchBundle, QosClass, ResourceFields, RuleCategory, Severity,
    TemplatePatch, TemplatePatchBody, ValuesPatch, VerificationStatus, Violation,
};
pub use values_patcher::patch_values_yaml;
pub use verify::{VerificationPipeline, VerificationResult, attach_status};
