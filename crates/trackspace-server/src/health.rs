//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::hub::Presence;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the hub answers, `"busy"` when it did not answer in
    /// time, `"shutting_down"` once it has stopped.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered chat connections.
    pub connections: usize,
    /// Connections that have named themselves.
    pub named_users: usize,
    pub broadcasts_total: u64,
    pub write_failures_total: u64,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Lifetime counters read from the metrics recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub broadcasts: u64,
    pub write_failures: u64,
}

/// What the dispatcher said when asked for presence.
#[derive(Debug, Clone, Copy)]
pub enum HubState<'a> {
    Running(&'a Presence),
    /// The queue was full or the answer was late.
    Busy,
    Stopped,
}

impl HubState<'_> {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running(_) => "ok",
            Self::Busy => "busy",
            Self::Stopped => "shutting_down",
        }
    }
}

/// Build a health response.
pub fn health_check(start_time: Instant, hub: HubState<'_>, totals: Totals) -> HealthResponse {
    let presence = match hub {
        HubState::Running(presence) => Some(presence),
        HubState::Busy | HubState::Stopped => None,
    };
    HealthResponse {
        status: hub.as_str().into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: presence.map_or(0, |p| p.connections),
        named_users: presence.map_or(0, |p| p.connected_user.len()),
        broadcasts_total: totals.broadcasts,
        write_failures_total: totals.write_failures,
    }
}
