/// Socket.IO Metrics
///
/// In-process counters surfaced through the health endpoint
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Counter key shared by every inbound event that has no handler
pub const UNHANDLED_EVENT: &str = "<unhandled>";

#[derive(Clone, Default)]
pub struct SocketMetrics {
    connections: Arc<RwLock<ConnectionMetrics>>,
    events: Arc<RwLock<EventMetrics>>,
}

#[derive(Default)]
struct ConnectionMetrics {
    total_activations: u64,
    active_sessions: u64,
    refused_activations: u64,
}

#[derive(Default)]
struct EventMetrics {
    events_received: HashMap<String, u64>,
    events_sent: HashMap<String, u64>,
    events_failed: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: u64,
    pub active: u64,
    pub refused: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub received: HashMap<String, u64>,
    pub sent: HashMap<String, u64>,
    pub failed: HashMap<String, u64>,
    pub total_received: u64,
    pub total_sent: u64,
    pub total_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionStats,
    pub events: EventStats,
}

impl SocketMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A namespace activation was accepted
    pub async fn record_connection(&self) {
        let mut conn = self.connections.write().await;
        conn.total_activations += 1;
        conn.active_sessions += 1;
    }

    pub async fn record_disconnection(&self) {
        let mut conn = self.connections.write().await;
        conn.active_sessions = conn.active_sessions.saturating_sub(1);
    }

    pub async fn record_refused(&self) {
        let mut conn = self.connections.write().await;
        conn.refused_activations += 1;
    }

    pub async fn record_event_received(&self, event: &str) {
        let mut events = self.events.write().await;
        *events.events_received.entry(event.to_string()).or_insert(0) += 1;
    }

    pub async fn record_event_unhandled(&self) {
        self.record_event_received(UNHANDLED_EVENT).await;
    }

    pub async fn record_event_sent(&self, event: &str, recipients: usize) {
        let mut events = self.events.write().await;
        *events.events_sent.entry(event.to_string()).or_insert(0) += recipients as u64;
    }

    pub async fn record_event_failed(&self, event: &str) {
        let mut events = self.events.write().await;
        *events.events_failed.entry(event.to_string()).or_insert(0) += 1;
    }

    pub async fn get_connection_metrics(&self) -> ConnectionStats {
        let conn = self.connections.read().await;
        ConnectionStats {
            total: conn.total_activations,
            active: conn.active_sessions,
            refused: conn.refused_activations,
        }
    }

    pub async fn get_event_metrics(&self) -> EventStats {
        let events = self.events.read().await;
        EventStats {
            total_received: events.events_received.values().sum(),
            total_sent: events.events_sent.values().sum(),
            total_failed: events.events_failed.values().sum(),
            received: events.events_received.clone(),
            sent: events.events_sent.clone(),
            failed: events.events_failed.clone(),
        }
    }

    pub async fn get_all_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.get_connection_metrics().await,
            events: self.get_event_metrics().await,
        }
    }
}
