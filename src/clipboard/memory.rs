//! Headless in-memory clipboard.
//!
//! A [`SelectionBackend`] with no native clipboard behind it. The
//! application side is driven through [`InMemoryBackend::copy`] and
//! [`InMemoryBackend::paste`]; the engine side sees an ordinary backend.
//! Used by the loopback self-test and by tests, and useful for hosts that
//! keep their own clipboard model.

use async_trait::async_trait;
use lamco_clipboard_core::{SelectionValue, TargetData};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clipboard::backend::{BackendContext, BackendFactory, ReadOutcome, SelectionBackend};
use crate::clipboard::error::Result;

/// Delay before each chunk of an incremental read
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct MemoryState {
    contents: Vec<(String, TargetData)>,
    owned: bool,
    advertised: Vec<String>,
    written: Vec<(String, TargetData)>,
    chunk_size: Option<usize>,
    ctx: Option<BackendContext>,
    reads: usize,
}

/// One in-memory selection
#[derive(Debug)]
pub struct InMemoryBackend {
    selection: String,
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    /// Create an empty selection
    pub fn new(selection: impl Into<String>) -> Self {
        Self {
            selection: selection.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Selection name
    pub fn selection(&self) -> &str {
        &self.selection
    }

    /// An application copies: it becomes the owner and the engine is told
    pub fn copy(&self, contents: Vec<(String, TargetData)>) {
        let ctx = {
            let mut state = self.state.lock();
            state.contents = contents;
            state.owned = false;
            state.advertised.clear();
            state.ctx.clone()
        };
        match ctx {
            Some(ctx) => ctx.notify_owner_changed(),
            None => debug!("{}: copy before attach", self.selection),
        }
    }

    /// Copy a text value, offered as `UTF8_STRING` and `TEXT`
    pub fn copy_text(&self, text: &str) {
        self.copy(vec![
            ("UTF8_STRING".to_string(), TargetData::text(text)),
            ("TEXT".to_string(), TargetData::bytes("TEXT", text.as_bytes())),
        ]);
    }

    /// Replace the contents without telling the engine
    pub fn set_contents(&self, contents: Vec<(String, TargetData)>) {
        self.state.lock().contents = contents;
    }

    /// An application pastes `target`. While the engine owns the selection
    /// the value comes from the peer.
    pub async fn paste(&self, target: &str) -> Option<TargetData> {
        let (ctx, local) = {
            let state = self.state.lock();
            if state.owned {
                (state.ctx.clone(), None)
            } else {
                (None, lookup(&state.contents, target))
            }
        };
        match ctx {
            Some(ctx) => ctx.request_contents(target).await,
            None => local,
        }
    }

    /// The engine owns the selection on behalf of the peer
    pub fn is_owned(&self) -> bool {
        self.state.lock().owned
    }

    /// Targets the engine advertised when it claimed the selection
    pub fn advertised_targets(&self) -> Vec<String> {
        self.state.lock().advertised.clone()
    }

    /// Values the engine stored without claiming
    pub fn written(&self) -> Vec<(String, TargetData)> {
        self.state.lock().written.clone()
    }

    /// Serve byte values larger than `chunk_size` incrementally
    pub fn set_incremental_chunk_size(&self, chunk_size: Option<usize>) {
        self.state.lock().chunk_size = chunk_size.filter(|n| *n > 0);
    }

    /// Number of reads the engine issued
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }
}

fn lookup(contents: &[(String, TargetData)], target: &str) -> Option<TargetData> {
    contents.iter().find(|(t, _)| t == target).map(|(_, d)| d.clone())
}

#[async_trait]
impl SelectionBackend for InMemoryBackend {
    async fn attach(&self, ctx: BackendContext) -> Result<()> {
        debug!("{}: in-memory backend attached", self.selection);
        self.state.lock().ctx = Some(ctx);
        Ok(())
    }

    async fn current_targets(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        if state.owned {
            return Ok(state.advertised.clone());
        }
        Ok(state.contents.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn read(&self, target: &str) -> Result<ReadOutcome> {
        let (data, ctx, chunk_size) = {
            let mut state = self.state.lock();
            state.reads += 1;
            if state.owned {
                return Ok(ReadOutcome::Empty);
            }
            (lookup(&state.contents, target), state.ctx.clone(), state.chunk_size)
        };
        let Some(data) = data else {
            return Ok(ReadOutcome::Empty);
        };
        let chunked = matches!(&data.value, SelectionValue::Bytes(b) if chunk_size.is_some_and(|n| b.len() > n));
        let (Some(ctx), Some(size), true) = (ctx, chunk_size, chunked) else {
            return Ok(ReadOutcome::Ready(data));
        };
        let bytes = data.as_bytes().unwrap_or_default().to_vec();
        let total_size = bytes.len();
        let type_tag = data.type_tag.clone();
        let stream = ctx.begin_transfer();
        let transfer_id = stream.id();
        debug!("{}: serving {} bytes of {} in chunks of {}", self.selection, total_size, target, size);
        tokio::spawn(async move {
            for chunk in bytes.chunks(size) {
                tokio::time::sleep(CHUNK_INTERVAL).await;
                stream.push(type_tag.clone(), chunk.to_vec());
            }
            tokio::time::sleep(CHUNK_INTERVAL).await;
            stream.push(type_tag, Vec::new());
        });
        Ok(ReadOutcome::Incremental {
            transfer_id,
            format: data.format,
            total_size,
        })
    }

    async fn write(&self, target: &str, data: TargetData) -> Result<()> {
        self.state.lock().written.push((target.to_string(), data));
        Ok(())
    }

    async fn claim_ownership(&self, targets: Vec<String>) -> Result<()> {
        let mut state = self.state.lock();
        state.owned = true;
        state.advertised = targets;
        state.contents.clear();
        Ok(())
    }

    async fn detach(&self) {
        self.state.lock().ctx = None;
    }
}

/// A set of in-memory selections, usable as a [`BackendFactory`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryClipboard {
    backends: HashMap<String, Arc<InMemoryBackend>>,
}

impl InMemoryClipboard {
    /// One backend per selection name
    pub fn new<I, S>(selections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backends = selections
            .into_iter()
            .map(|s| {
                let name = s.into();
                (name.clone(), Arc::new(InMemoryBackend::new(name)))
            })
            .collect();
        Self { backends }
    }

    /// Backend of `selection`
    pub fn backend(&self, selection: &str) -> Option<Arc<InMemoryBackend>> {
        self.backends.get(selection).cloned()
    }

    /// Selection names, sorted
    pub fn selections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl BackendFactory for InMemoryClipboard {
    fn create(&self, selection: &str) -> Option<Arc<dyn SelectionBackend>> {
        self.backend(selection).map(|b| b as Arc<dyn SelectionBackend>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::event::EngineEvent;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_copy_notifies_attached_engine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = InMemoryBackend::new("CLIPBOARD");
        backend.attach(BackendContext::new("CLIPBOARD", tx)).await.unwrap();
        backend.copy_text("hi");
        assert!(matches!(rx.recv().await, Some(EngineEvent::OwnerChanged { .. })));
        assert_eq!(
            backend.current_targets().await.unwrap(),
            vec!["UTF8_STRING".to_string(), "TEXT".to_string()]
        );
        assert_eq!(backend.paste("TEXT").await.unwrap().as_bytes().unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_claim_hides_local_contents() {
        let backend = InMemoryBackend::new("PRIMARY");
        backend.set_contents(vec![("STRING".to_string(), TargetData::bytes("STRING", b"x".to_vec()))]);
        backend.claim_ownership(vec!["UTF8_STRING".to_string()]).await.unwrap();
        assert!(backend.is_owned());
        assert_eq!(backend.read("STRING").await.unwrap(), ReadOutcome::Empty);
        assert_eq!(backend.current_targets().await.unwrap(), vec!["UTF8_STRING".to_string()]);
        // owned but not attached: nobody to ask
        assert_eq!(backend.paste("UTF8_STRING").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_read_pushes_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = InMemoryBackend::new("CLIPBOARD");
        backend.attach(BackendContext::new("CLIPBOARD", tx)).await.unwrap();
        backend.set_contents(vec![("STRING".to_string(), TargetData::bytes("STRING", vec![7u8; 10]))]);
        backend.set_incremental_chunk_size(Some(4));

        let outcome = backend.read("STRING").await.unwrap();
        assert!(matches!(outcome, ReadOutcome::Incremental { total_size: 10, .. }));

        let mut sizes = Vec::new();
        while let Some(EngineEvent::IncrementalChunk { data, .. }) = rx.recv().await {
            sizes.push(data.len());
            if data.is_empty() {
                break;
            }
        }
        assert_eq!(sizes, vec![4, 4, 2, 0]);
        assert_eq!(backend.read_count(), 1);
    }

    #[test]
    fn test_factory() {
        let clipboard = InMemoryClipboard::new(["PRIMARY", "CLIPBOARD"]);
        assert_eq!(clipboard.selections(), vec!["CLIPBOARD".to_string(), "PRIMARY".to_string()]);
        assert!(clipboard.create("CLIPBOARD").is_some());
        assert!(clipboard.create("SECONDARY").is_none());
    }
}
