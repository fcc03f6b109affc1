//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Distinct principals with at least one connection.
    pub principals: usize,
    /// Channels with at least one member.
    pub channels: usize,
}

/// Registry counters reported by `/health`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryCounts {
    /// Live connections.
    pub connections: usize,
    /// Distinct principals.
    pub principals: usize,
    /// Non-empty channels.
    pub channels: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, counts: RegistryCounts, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counts.connections,
        principals: counts.principals,
        channels: counts.channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), RegistryCounts::default(), false);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn status_reflects_shutdown() {
        let resp = health_check(Instant::now(), RegistryCounts::default(), true);
        assert_eq!(resp.status, "shutting_down");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, RegistryCounts::default(), false);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let counts = RegistryCounts {
            connections: 3,
            principals: 2,
            channels: 1,
        };
        let json = serde_json::to_value(health_check(Instant::now(), counts, false)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 3);
        assert_eq!(json["principals"], 2);
        assert_eq!(json["channels"], 1);
        assert!(json["uptime_secs"].is_number());
    }
}
