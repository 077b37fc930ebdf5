//! Reverse-path table for requests this node relayed.
//!
//! Maps `(requester, request id)` to the connection the request came in on,
//! so the reply retraces the same hop chain instead of being re-resolved.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::application::routing::ConnectionId;
use crate::domain::ids::{NodeId, RequestId};

#[derive(Debug, Clone, Copy)]
struct ForwardedEntry {
    inbound: ConnectionId,
    expires_at: Instant,
}

#[derive(Default)]
pub struct ForwardedRequests {
    entries: DashMap<(NodeId, RequestId), ForwardedEntry>,
}

impl ForwardedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, requester: NodeId, request_id: RequestId, inbound: ConnectionId, ttl: Duration) {
        self.entries.insert(
            (requester, request_id),
            ForwardedEntry {
                inbound,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove and return the inbound connection, unless the entry expired.
    pub fn take(&self, requester: &NodeId, request_id: &RequestId) -> Option<ConnectionId> {
        let (_, entry) = self
            .entries
            .remove(&(requester.clone(), request_id.clone()))?;
        (entry.expires_at > Instant::now()).then_some(entry.inbound)
    }

    pub fn forget(&self, requester: &NodeId, request_id: &RequestId) {
        self.entries.remove(&(requester.clone(), request_id.clone()));
    }

    /// Returns how many entries were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::routing::Connection;

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let table = ForwardedRequests::new();
        let (conn, _rx) = Connection::channel(1, None);
        table.record(node("A"), RequestId::from("r1"), conn.id(), Duration::from_secs(5));
        table.record(node("A"), RequestId::from("r2"), conn.id(), Duration::from_secs(5));

        assert_eq!(table.take(&node("A"), &RequestId::from("r1")), Some(conn.id()));
        assert_eq!(table.take(&node("A"), &RequestId::from("r1")), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(table.purge_expired(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_not_returned() {
        let table = ForwardedRequests::new();
        let (conn, _rx) = Connection::channel(1, None);
        table.record(node("A"), RequestId::from("r1"), conn.id(), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.take(&node("A"), &RequestId::from("r1")), None);
    }
}
