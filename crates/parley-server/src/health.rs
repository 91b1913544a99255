//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hub::HubSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers.
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Name of the inference gateway in use (`http`, `mock`).
    pub gateway: String,
    pub connections: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub evictions: u64,
}

pub fn health_check(
    start_time: Instant,
    started_at: DateTime<Utc>,
    gateway: &str,
    hub: HubSnapshot,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        started_at,
        uptime_secs: start_time.elapsed().as_secs(),
        gateway: gateway.to_string(),
        connections: hub.live_connections,
        broadcasts: hub.broadcasts,
        delivered: hub.delivered,
        evictions: hub.evictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_hub_counters() {
        let snapshot = HubSnapshot {
            live_connections: 3,
            broadcasts: 10,
            delivered: 28,
            evictions: 1,
        };
        let resp = health_check(Instant::now(), Utc::now(), "mock", snapshot);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.connections, 3);
        assert_eq!(resp.delivered, 28);
        assert_eq!(resp.evictions, 1);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, Utc::now(), "http", HubSnapshot::default());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), Utc::now(), "http", HubSnapshot::default());
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["gateway"], "http");
        assert_eq!(parsed["connections"], 0);
        assert!(parsed["uptime_secs"].is_number());
        assert!(parsed["started_at"].is_string());
    }
}
