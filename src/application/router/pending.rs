//! Outstanding outbound requests, keyed by correlation id.
//!
//! Each entry owns the sender half of a oneshot channel. Whoever removes the
//! entry first (matching reply, timeout, cancel, dropped caller) decides the
//! outcome, so a request ends exactly once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use super::error::RpcError;
use crate::domain::ids::{NodeId, RequestId};
use crate::domain::message::ResponseMessage;

pub type ReplyResult = Result<ResponseMessage, RpcError>;

struct PendingEntry {
    destination: NodeId,
    action: String,
    sent_at: DateTime<Utc>,
    started: Instant,
    reply: oneshot::Sender<ReplyResult>,
}

/// Admin view of a pending request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingInfo {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub action: String,
    pub sent_at: DateTime<Utc>,
}

/// What the completing side learns about the request it just finished.
#[derive(Debug, Clone)]
pub struct Completed {
    pub destination: NodeId,
    pub action: String,
    pub elapsed: Duration,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<RequestId, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a request with the same id is already outstanding.
    pub fn register(
        &self,
        request_id: RequestId,
        destination: NodeId,
        action: impl Into<String>,
    ) -> Option<oneshot::Receiver<ReplyResult>> {
        match self.entries.entry(request_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingEntry {
                    destination,
                    action: action.into(),
                    sent_at: Utc::now(),
                    started: Instant::now(),
                    reply: tx,
                });
                Some(rx)
            }
        }
    }

    /// Complete with a reply that came from `from`. A reply whose source is
    /// not the node the request went to leaves the entry untouched.
    pub fn complete(&self, request_id: &RequestId, from: &NodeId, result: ReplyResult) -> Option<Completed> {
        let (_, entry) = self
            .entries
            .remove_if(request_id, |_, entry| &entry.destination == from)?;
        Some(Self::finish(entry, result))
    }

    /// Complete regardless of who answers; used for local outcomes.
    pub fn fail(&self, request_id: &RequestId, error: RpcError) -> Option<Completed> {
        let (_, entry) = self.entries.remove(request_id)?;
        Some(Self::finish(entry, Err(error)))
    }

    /// Outcome for a caller whose deadline passed. `None` means the entry
    /// was still outstanding and is now gone, so the request timed out.
    /// Otherwise a reply or a cancel already took the entry and its result
    /// is awaited from the receiver.
    pub async fn settle_expired(
        &self,
        request_id: &RequestId,
        reply: &mut oneshot::Receiver<ReplyResult>,
    ) -> Option<ReplyResult> {
        if self.remove(request_id) {
            return None;
        }
        Some(
            reply
                .await
                .unwrap_or_else(|_| Err(RpcError::Cancelled(request_id.clone()))),
        )
    }

    /// Drop the entry without completing it.
    pub fn remove(&self, request_id: &RequestId) -> bool {
        self.entries.remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let mut list: Vec<PendingInfo> = self
            .entries
            .iter()
            .map(|entry| PendingInfo {
                request_id: entry.key().clone(),
                destination: entry.destination.clone(),
                action: entry.action.clone(),
                sent_at: entry.sent_at,
            })
            .collect();
        list.sort_by_key(|info| info.sent_at);
        list
    }

    fn finish(entry: PendingEntry, result: ReplyResult) -> Completed {
        if entry.reply.send(result).is_err() {
            warn!(destination = %entry.destination, action = %entry.action, "Caller stopped waiting");
        }
        Completed {
            destination: entry.destination,
            action: entry.action,
            elapsed: entry.started.elapsed(),
        }
    }
}

/// Removes the entry when the waiting caller goes away.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    request_id: RequestId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, request_id: RequestId) -> Self {
        Self { pending, request_id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}
