//! Fan-out of one outbound frame to every registered connection.

use axum::extract::ws::Utf8Bytes;
use tracing::{debug, error, warn};
use trackspace_core::{ConnectionId, OutboundMessage};
use trackspace_telemetry::MetricsRecorder;

use super::metric;
use super::registry::Registry;
use super::DisconnectCause;

/// Outcome of one fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections removed because their write failed.
    pub pruned: Vec<ConnectionId>,
}

/// Write `message` to every registered connection.
///
/// The frame is serialized once. A connection whose write fails is removed
/// from the registry and closed, and the fan-out carries on with the rest.
/// Nothing here fails the caller.
pub fn broadcast(
    registry: &mut Registry,
    message: &OutboundMessage,
    metrics: &MetricsRecorder,
) -> BroadcastReport {
    let Some(frame) = encode(message) else {
        return BroadcastReport::default();
    };

    let mut report = BroadcastReport::default();
    for handle in registry.handles() {
        match handle.send(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(conn_id = %handle.id(), error = %e, kind = e.error_kind(), "broadcast write failed, pruning");
                report.pruned.push(handle.id().clone());
            }
        }
    }
    prune(registry, &report.pruned, metrics);

    metrics.counter_inc(metric::BROADCASTS_TOTAL, &[("condition", message.condition.as_str())], 1);
    metrics.histogram_observe(metric::BROADCAST_RECIPIENTS, &[], report.delivered as f64);
    debug!(
        condition = %message.condition,
        recipients = report.delivered,
        pruned = report.pruned.len(),
        "broadcast"
    );
    report
}

/// Write `message` to a single registered connection, pruning it on failure.
/// Returns whether the frame was queued.
pub fn send_to(
    registry: &mut Registry,
    id: &ConnectionId,
    message: &OutboundMessage,
    metrics: &MetricsRecorder,
) -> bool {
    let Some(handle) = registry.get(id) else {
        return false;
    };
    let Some(frame) = encode(message) else {
        return false;
    };
    match handle.send(frame) {
        Ok(()) => true,
        Err(e) => {
            warn!(conn_id = %id, error = %e, "direct write failed, pruning");
            prune(registry, std::slice::from_ref(id), metrics);
            false
        }
    }
}

fn encode(message: &OutboundMessage) -> Option<Utf8Bytes> {
    match message.to_json() {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            error!(condition = %message.condition, error = %e, "failed to serialize outbound frame");
            None
        }
    }
}

fn prune(registry: &mut Registry, ids: &[ConnectionId], metrics: &MetricsRecorder) {
    for id in ids {
        if let Some(handle) = registry.remove(id) {
            handle.close();
            debug!(conn_id = %id, dropped = handle.drop_count(), "connection pruned");
            metrics.counter_inc(metric::WRITE_FAILURES_TOTAL, &[], 1);
            metrics.counter_inc(
                metric::DISCONNECTS_TOTAL,
                &[("cause", DisconnectCause::WriteError.as_str())],
                1,
            );
        }
    }
    if !ids.is_empty() {
        metrics.gauge_set(metric::CONNECTIONS_ACTIVE, &[], registry.len() as f64);
    }
}
