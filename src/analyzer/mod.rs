//! # Analyzer Module
//!
//! Chart analysis: rule evaluation, fix verification, patching and impact
//! estimation live under [`helm_optimize`].

pub mod helm_optimize;
