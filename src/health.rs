use crate::{PoolStats, ScreenshotService};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub service: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_store: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renderer: Option<PoolStats>,
}

impl HealthReport {
    pub fn collect(service: &ScreenshotService, rate_limit_store: Option<&'static str>) -> Self {
        let renderer = service.renderer_stats();
        Self {
            status: assess(renderer.as_ref()),
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            store: service.store_name(),
            rate_limit_store,
            renderer,
        }
    }
}

/// Critical once the pool stops accepting work, warning while every engine is busy.
pub fn assess(stats: Option<&PoolStats>) -> HealthLevel {
    match stats {
        Some(stats) if stats.shutting_down => HealthLevel::Critical,
        Some(stats) if stats.max_active > 0 && stats.active >= stats.max_active => HealthLevel::Warning,
        _ => HealthLevel::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(active: usize, shutting_down: bool) -> PoolStats {
        PoolStats {
            max_active: 4,
            active,
            available: 4 - active,
            idle: 0,
            launched: active,
            closed: 0,
            checkouts: active,
            shutting_down,
        }
    }

    #[test]
    fn test_assess_levels() {
        assert_eq!(assess(None), HealthLevel::Healthy);
        assert_eq!(assess(Some(&stats(1, false))), HealthLevel::Healthy);
        assert_eq!(assess(Some(&stats(4, false))), HealthLevel::Warning);
        assert_eq!(assess(Some(&stats(0, true))), HealthLevel::Critical);
    }

    #[test]
    fn test_report_serializes_lowercase_status() {
        let report = HealthReport {
            status: HealthLevel::Warning,
            service: "screenshot-server",
            version: "0.1.0",
            store: "memory",
            rate_limit_store: None,
            renderer: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "warning");
        assert!(json.get("renderer").is_none());
    }
}
