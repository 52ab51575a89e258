//! CPU and memory quantity parsing.
//!
//! Converts Kubernetes quantity strings (and bare YAML numbers) into
//! millicores and bytes. Malformed quantities parse to `None` so callers can
//! treat them as absent instead of failing the whole chart.

use regex::Regex;
use serde_yaml::Value;
use std::sync::LazyLock;

// ============================================================================
// CPU
// ============================================================================

static CPU_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?|\.\d+)(m)?$").unwrap());

/// Parse a CPU value string to millicores.
///
/// # Examples
/// - "100m" -> 100
/// - "1" -> 1000
/// - "1.5" -> 1500
/// - "0.1" -> 100
pub fn parse_cpu_to_millicores(cpu: &str) -> Option<u64> {
    let cpu = cpu.trim().trim_matches('"').trim_matches('\'');
    let caps = CPU_REGEX.captures(cpu)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;

    if caps.get(2).is_some() {
        Some(value.round() as u64)
    } else {
        Some((value * 1000.0).round() as u64)
    }
}

/// Convert millicores to a CPU quantity string.
///
/// # Examples
/// - 100 -> "100m"
/// - 1000 -> "1"
/// - 1500 -> "1500m"
pub fn millicores_to_cpu_string(millicores: u64) -> String {
    if millicores >= 1000 && millicores % 1000 == 0 {
        format!("{}", millicores / 1000)
    } else {
        format!("{}m", millicores)
    }
}

// ============================================================================
// Memory
// ============================================================================

static MEMORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?)(Ki|Mi|Gi|Ti|Pi|Ei|k|K|M|G|T|P|E)?$").unwrap()
});

/// Parse a memory value string to bytes.
///
/// # Examples
/// - "128Mi" -> 134217728
/// - "1Gi" -> 1073741824
/// - "1000000000" -> 1000000000
pub fn parse_memory_to_bytes(memory: &str) -> Option<u64> {
    let memory = memory.trim().trim_matches('"').trim_matches('\'');
    let caps = MEMORY_REGEX.captures(memory)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    let multiplier: f64 = match unit {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        // Decimal units
        "k" | "K" => 1000.0,
        "M" => 1000.0_f64.powi(2),
        "G" => 1000.0_f64.powi(3),
        "T" => 1000.0_f64.powi(4),
        "P" => 1000.0_f64.powi(5),
        "E" => 1000.0_f64.powi(6),
        _ => return None,
    };

    Some((value * multiplier).round() as u64)
}

/// Convert bytes to a memory quantity string using binary units.
///
/// # Examples
/// - 134217728 -> "128Mi"
/// - 1073741824 -> "1Gi"
pub fn bytes_to_memory_string(bytes: u64) -> String {
    const KI: u64 = 1024;
    const MI: u64 = KI * 1024;
    const GI: u64 = MI * 1024;
    const TI: u64 = GI * 1024;

    if bytes >= TI && bytes % TI == 0 {
        format!("{}Ti", bytes / TI)
    } else if bytes >= GI && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes >= MI && bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else if bytes >= MI {
        // Round up to Mi so the quantity never shrinks
        format!("{}Mi", bytes.div_ceil(MI))
    } else if bytes >= KI && bytes % KI == 0 {
        format!("{}Ki", bytes / KI)
    } else {
        format!("{}", bytes)
    }
}

// ============================================================================
// YAML values
// ============================================================================

/// Read a CPU quantity from a YAML scalar (`"250m"`, `0.5`, `2`).
pub fn cpu_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => parse_cpu_to_millicores(s),
        Value::Number(n) => n.as_f64().filter(|v| *v >= 0.0).map(|v| (v * 1000.0).round() as u64),
        _ => None,
    }
}

/// Read a memory quantity from a YAML scalar (`"512Mi"`, `1073741824`).
pub fn memory_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => parse_memory_to_bytes(s),
        Value::Number(n) => n.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64),
        _ => None,
    }
}

/// Human-readable rendering of an optional CPU quantity.
pub fn describe_cpu(millicores: Option<u64>) -> String {
    millicores
        .map(millicores_to_cpu_string)
        .unwrap_or_else(|| "unset".to_string())
}

/// Human-readable rendering of an optional memory quantity.
pub fn describe_memory(bytes: Option<u64>) -> String {
    bytes
        .map(bytes_to_memory_string)
        .unwrap_or_else(|| "unset".to_string())
}
