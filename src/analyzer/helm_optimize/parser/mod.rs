//! Chart parsing.
//!
//! - `quantity`: CPU and memory quantity strings
//! - `metadata`: Chart.yaml
//! - `chart`: the normalized [`Chart`](super::types::Chart) record

pub mod chart;
pub mod metadata;
pub mod quantity;

pub use chart::{
    parse_chart, parse_chart_dir, parse_release_values, parse_values_content, read_values_file,
    resolve_chart_name,
};
pub use metadata::{ChartMetadata, Dependency, parse_chart_yaml, read_chart_metadata};
pub use quantity::{
    bytes_to_memory_string, millicores_to_cpu_string, parse_cpu_to_millicores,
    parse_memory_to_bytes,
};
