//! Outstanding request tracking.
//!
//! Every request sent to the peer gets an id and a timeout. An entry leaves
//! the table exactly once: when the peer answers, when the timer fires, or
//! when the engine shuts down. Whatever comes second finds nothing and is
//! ignored.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::clipboard::event::{EngineEvent, EventSender, TimerEvent};
use crate::clipboard::timer::ScheduledTask;

/// Default timeout for requests sent to the peer: 3 seconds
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(3);

/// A request waiting for the peer
#[derive(Debug)]
pub struct OutstandingRequest {
    /// Request id
    pub request_id: u64,
    /// Local selection name
    pub selection: String,
    /// Requested target
    pub target: String,
    /// When the request times out
    pub deadline: Instant,
    timer: ScheduledTask,
}

/// Allocates request ids and tracks their timeouts
#[derive(Debug)]
pub struct RequestTracker {
    next_id: u64,
    outstanding: HashMap<u64, OutstandingRequest>,
    timeout: Duration,
    events: EventSender,
    total: u64,
}

impl RequestTracker {
    /// Create a tracker posting timeouts to `events`
    pub fn new(timeout: Duration, events: EventSender) -> Self {
        Self {
            next_id: 0,
            outstanding: HashMap::new(),
            timeout,
            events,
            total: 0,
        }
    }

    /// Register a request and start its timer. Returns the new request id.
    pub fn request(&mut self, selection: &str, target: &str) -> u64 {
        // ids only grow, so a live id is never handed out twice
        self.next_id += 1;
        let request_id = self.next_id;
        let timer = ScheduledTask::schedule(
            request_id,
            self.timeout,
            self.events.clone(),
            EngineEvent::Timer(TimerEvent::RequestTimeout { request_id }),
        );
        self.outstanding.insert(
            request_id,
            OutstandingRequest {
                request_id,
                selection: selection.to_string(),
                target: target.to_string(),
                deadline: Instant::now() + self.timeout,
                timer,
            },
        );
        self.total += 1;
        debug!(
            "request {} for {}:{} outstanding ({} pending)",
            request_id,
            selection,
            target,
            self.outstanding.len()
        );
        request_id
    }

    /// The peer answered: cancel the timer and remove the entry
    pub fn resolve(&mut self, request_id: u64) -> Option<OutstandingRequest> {
        let mut entry = self.outstanding.remove(&request_id)?;
        entry.timer.cancel();
        Some(entry)
    }

    /// The timer fired: remove the entry if it is still there
    pub fn expire(&mut self, request_id: u64) -> Option<OutstandingRequest> {
        self.outstanding.remove(&request_id)
    }

    /// Remove every entry, cancelling their timers
    pub fn drain(&mut self) -> Vec<OutstandingRequest> {
        let mut entries: Vec<_> = self.outstanding.drain().map(|(_, entry)| entry).collect();
        for entry in &mut entries {
            entry.timer.cancel();
        }
        entries.sort_by_key(|entry| entry.request_id);
        entries
    }

    /// Returns true if the request is still waiting
    pub fn contains(&self, request_id: u64) -> bool {
        self.outstanding.contains_key(&request_id)
    }

    /// Ids of outstanding requests, in allocation order
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.outstanding.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns true if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Requests sent since the engine started
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Timeout applied to new requests
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_unique_while_live() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = RequestTracker::new(DEFAULT_REMOTE_TIMEOUT, tx);
        let mut seen = HashSet::new();
        for i in 0..100 {
            let id = tracker.request("CLIPBOARD", "TEXT");
            assert!(seen.insert(id));
            if i % 3 == 0 {
                tracker.resolve(id);
            }
        }
        assert_eq!(tracker.total(), 100);
        assert_eq!(tracker.len(), 66);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = RequestTracker::new(DEFAULT_REMOTE_TIMEOUT, tx);
        let id = tracker.request("CLIPBOARD", "UTF8_STRING");
        let entry = tracker.resolve(id).unwrap();
        assert_eq!(entry.target, "UTF8_STRING");
        assert!(tracker.resolve(id).is_none());
        // late timeout is a no-op
        assert!(tracker.expire(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = RequestTracker::new(Duration::from_millis(500), tx);
        let id = tracker.request("PRIMARY", "STRING");

        tokio::time::sleep(Duration::from_millis(600)).await;
        match rx.try_recv() {
            Ok(EngineEvent::Timer(TimerEvent::RequestTimeout { request_id })) => assert_eq!(request_id, id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tracker.expire(id).is_some());
        assert!(!tracker.contains(id));
        assert!(tracker.resolve(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_request_never_times_out() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tracker = RequestTracker::new(Duration::from_millis(100), tx);
        let id = tracker.request("CLIPBOARD", "TARGETS");
        tracker.resolve(id);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tracker = RequestTracker::new(DEFAULT_REMOTE_TIMEOUT, tx);
        let a = tracker.request("CLIPBOARD", "TEXT");
        let b = tracker.request("PRIMARY", "TEXT");
        assert_eq!(tracker.pending_ids(), vec![a, b]);
        let drained = tracker.drain();
        assert_eq!(drained.iter().map(|e| e.request_id).collect::<Vec<_>>(), vec![a, b]);
        assert!(tracker.is_empty());
    }
}
