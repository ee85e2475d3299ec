//! Statistics snapshots
//!
//! All of these are plain values copied out of the owning components;
//! building one never mutates loader state.

use crate::hooks::HookStats;
use serde::Serialize;

/// `part / whole` as a percentage in `[0, 100]`, 0 when `whole` is 0
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 100.0).clamp(0.0, 100.0)
}

/// Compile cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub evictions: u64,
    /// Sum of entry sizes in bytes
    pub current_size: u64,
    pub size_limit: u64,
    pub hit_rate: f64,
    pub utilization: f64,
}

/// In-memory module registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Completed modules held
    pub size: usize,
    pub max_size: usize,
    pub utilization: f64,
}

/// Settings reported alongside the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSnapshot {
    pub cache_enabled: bool,
    pub node_compat_enabled: bool,
    pub max_cache_size: usize,
}

/// Everything `get_statistics` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub loads_total: u64,
    pub loads_success: u64,
    pub loads_failed: u64,
    pub success_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    /// Approximate bytes held by module records
    pub memory_used: u64,
    pub module_cache: ModuleCacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_cache: Option<CompileCacheStats>,
    pub hooks: HookStats,
    pub configuration: ConfigurationSnapshot,
}

/// Load counters of the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounters {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

/// Loads performed during one reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadDelta {
    pub loads_attempted: u64,
    pub loads_successful: u64,
    pub loads_failed: u64,
}

impl ReloadDelta {
    /// Difference between two counter readings
    pub fn between(before: LoadCounters, after: LoadCounters) -> Self {
        Self {
            loads_attempted: after.total.saturating_sub(before.total),
            loads_successful: after.success.saturating_sub(before.success),
            loads_failed: after.failed.saturating_sub(before.failed),
        }
    }
}

/// Outcome of `reload_module`; failures are reported here, never raised
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResult {
    /// The path or specifier as given
    pub path: String,
    /// Canonical id it resolved to
    pub resolved_path: Option<String>,
    /// Whether a record existed before the reload
    pub was_cached: bool,
    pub reload_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub statistics: ReloadDelta,
    /// The module's exports after a successful reload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exports: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_bounds() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(5, 5), 100.0);
        assert_eq!(percentage(1, 4), 25.0);
        assert_eq!(percentage(9, 3), 100.0);
    }

    #[test]
    fn test_reload_delta() {
        let before = LoadCounters { total: 3, success: 2, failed: 1 };
        let after = LoadCounters { total: 5, success: 3, failed: 2 };
        assert_eq!(
            ReloadDelta::between(before, after),
            ReloadDelta { loads_attempted: 2, loads_successful: 1, loads_failed: 1 }
        );
    }

    #[test]
    fn test_statistics_serialize_camel_case() {
        let stats = CompileCacheStats { current_size: 10, size_limit: 100, ..Default::default() };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["currentSize"], 10);
        assert_eq!(json["sizeLimit"], 100);
        assert_eq!(json["hitRate"], 0.0);
    }
}
