//! Native selection backend contract.
//!
//! A backend wraps one platform clipboard selection (X11, Wayland, win32,
//! macOS pasteboard, or the headless [`InMemoryBackend`]). The engine picks
//! one per selection at startup through a [`BackendFactory`] and only talks
//! to it through spawned tasks, so a slow backend never stalls the loop.
//!
//! Backends report asynchronous native activity through the
//! [`BackendContext`] they receive in [`SelectionBackend::attach`].
//!
//! [`InMemoryBackend`]: crate::clipboard::memory::InMemoryBackend

use async_trait::async_trait;
use lamco_clipboard_core::{BitFormat, TargetData};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::clipboard::error::Result;
use crate::clipboard::event::{EngineEvent, EventSender};

/// Answer of a native read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The whole value
    Ready(TargetData),
    /// The owner had nothing for this target
    Empty,
    /// The value follows in chunks pushed through a [`ChunkStream`]
    Incremental {
        /// Id of the stream the chunks arrive on
        transfer_id: u64,
        /// Element width of the chunks
        format: BitFormat,
        /// Total size in bytes
        total_size: usize,
    },
}

/// Handle given to a backend for reporting native activity
#[derive(Debug, Clone)]
pub struct BackendContext {
    selection: String,
    events: EventSender,
    next_transfer: Arc<AtomicU64>,
}

impl BackendContext {
    /// Create a context for `selection`
    pub fn new(selection: impl Into<String>, events: EventSender) -> Self {
        Self {
            selection: selection.into(),
            events,
            next_transfer: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Local selection name
    pub fn selection(&self) -> &str {
        &self.selection
    }

    /// A native application took ownership of the selection
    pub fn notify_owner_changed(&self) {
        self.post(EngineEvent::OwnerChanged {
            selection: self.selection.clone(),
        });
    }

    /// Open the stream for one incremental read.
    ///
    /// Return its [`ChunkStream::id`] in [`ReadOutcome::Incremental`]; chunks
    /// of a stream the engine is no longer reading are dropped.
    pub fn begin_transfer(&self) -> ChunkStream {
        ChunkStream {
            id: self.next_transfer.fetch_add(1, Ordering::Relaxed),
            ctx: self.clone(),
        }
    }

    /// A native client is pasting while the peer owns the selection.
    ///
    /// Resolves to `None` when the peer has no data, the request times out
    /// or the engine stops.
    pub async fn request_contents(&self, target: impl Into<String>) -> Option<TargetData> {
        let (reply, rx) = oneshot::channel();
        self.post(EngineEvent::LocalRequest {
            selection: self.selection.clone(),
            target: target.into(),
            reply,
        });
        rx.await.ok().flatten()
    }

    fn post(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("{} event dropped: engine stopped", self.selection);
        }
    }
}

/// Chunk sink of one incremental read
#[derive(Debug, Clone)]
pub struct ChunkStream {
    id: u64,
    ctx: BackendContext,
}

impl ChunkStream {
    /// Transfer id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next chunk. An empty chunk ends the transfer.
    pub fn push(&self, type_tag: impl Into<String>, data: Vec<u8>) {
        self.ctx.post(EngineEvent::IncrementalChunk {
            selection: self.ctx.selection.clone(),
            transfer_id: self.id,
            type_tag: type_tag.into(),
            data,
        });
    }
}

/// Native clipboard selection
#[async_trait]
pub trait SelectionBackend: Send + Sync {
    /// Start watching the native selection
    async fn attach(&self, ctx: BackendContext) -> Result<()>;

    /// Targets the current owner offers
    async fn current_targets(&self) -> Result<Vec<String>>;

    /// Read the current owner's value for `target`
    async fn read(&self, target: &str) -> Result<ReadOutcome>;

    /// Store a value in the native selection without claiming it
    async fn write(&self, target: &str, data: TargetData) -> Result<()>;

    /// Become the native owner, advertising `targets` on behalf of the peer
    async fn claim_ownership(&self, targets: Vec<String>) -> Result<()>;

    /// Stop watching and release resources
    async fn detach(&self);
}

/// Creates the backend for each selection at startup
pub trait BackendFactory: Send + Sync {
    /// Backend for `selection`, or `None` to leave it inert
    fn create(&self, selection: &str) -> Option<Arc<dyn SelectionBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn(&str) -> Option<Arc<dyn SelectionBackend>> + Send + Sync,
{
    fn create(&self, selection: &str) -> Option<Arc<dyn SelectionBackend>> {
        self(selection)
    }
}

/// Factory for engines without any native clipboard
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackend;

impl BackendFactory for NoBackend {
    fn create(&self, _selection: &str) -> Option<Arc<dyn SelectionBackend>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_context_posts_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = BackendContext::new("CLIPBOARD", tx);
        ctx.notify_owner_changed();
        let stream = ctx.begin_transfer();
        stream.push("STRING", b"abc".to_vec());

        assert!(matches!(rx.recv().await, Some(EngineEvent::OwnerChanged { selection }) if selection == "CLIPBOARD"));
        match rx.recv().await {
            Some(EngineEvent::IncrementalChunk {
                transfer_id,
                type_tag,
                data,
                ..
            }) => {
                assert_eq!(transfer_id, stream.id());
                assert_eq!(type_tag, "STRING");
                assert_eq!(data, b"abc");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transfer_ids_are_unique_across_clones() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = BackendContext::new("CLIPBOARD", tx);
        let first = ctx.begin_transfer().id();
        let second = ctx.clone().begin_transfer().id();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_request_contents_resolves_none_when_engine_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let ctx = BackendContext::new("CLIPBOARD", tx);
        assert_eq!(ctx.request_contents("UTF8_STRING").await, None);
    }

    #[tokio::test]
    async fn test_request_contents_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = BackendContext::new("PRIMARY", tx);
        let engine = tokio::spawn(async move {
            if let Some(EngineEvent::LocalRequest { target, reply, .. }) = rx.recv().await {
                assert_eq!(target, "TEXT");
                let _ = reply.send(Some(TargetData::bytes("TEXT", b"hi".to_vec())));
            }
        });
        let data = ctx.request_contents("TEXT").await.unwrap();
        assert_eq!(data.as_bytes().unwrap(), b"hi");
        engine.await.unwrap();
    }

    #[test]
    fn test_no_backend_factory() {
        assert!(NoBackend.create("CLIPBOARD").is_none());
    }
}
