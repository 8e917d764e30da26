//! Protocol Dispatcher
//!
//! The engine loop. Owns every [`SelectionProxy`], the outstanding request
//! table, the wire codec and the transport, and is the only code that
//! touches them. Everything reaches it as an [`EngineEvent`] on one channel.
//!
//! Inbound: transport → [`EngineHandle::handle_packet`] → dispatch →
//! request tracker or proxy → codec decode → native write.
//!
//! Outbound: native change → proxy → [`ProxyAction`] → codec encode →
//! [`PacketSender`].

use lamco_clipboard_core::{BitFormat, CodecConfig, PreparedContents, TargetData, TargetFilter, WireCodec, WirePayload};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clipboard::backend::{BackendContext, BackendFactory};
use crate::clipboard::error::{recovery_action, Direction, RecoveryAction, Result, SyncError};
use crate::clipboard::event::{EngineCommand, EngineEvent, EventReceiver, EventSender, TimerEvent};
use crate::clipboard::packet::{Packet, TokenContents, WireValue};
use crate::clipboard::proxy::{
    default_translated_targets, ProxyAction, ProxyConfig, ProxyInfo, SelectionProxy, DEFAULT_EMIT_DELAY,
    DEFAULT_NATIVE_TIMEOUT, DEFAULT_OWNER_CHANGE_EMBARGO,
};
use crate::clipboard::requests::{RequestTracker, DEFAULT_REMOTE_TIMEOUT};
use crate::clipboard::transport::PacketSender;

/// Runtime engine configuration, compiled and validated
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Selections synchronized on this side
    pub local_selections: Vec<String>,
    /// Selections the peer exposes
    pub remote_selections: Vec<String>,
    /// Local ↔ remote name for the main clipboard
    pub translation: Option<(String, String)>,
    /// Local contents may be sent to the peer
    pub can_send: bool,
    /// Peer contents may be written locally
    pub can_receive: bool,
    /// Assume the peer wants target lists until told otherwise
    pub want_targets: bool,
    /// Assume the peer is greedy until its first token says otherwise
    pub greedy_client: bool,
    /// Ask the peer for tokens with contents on every change
    pub greedy: bool,
    /// Ask the peer to push text to our native clipboard immediately
    pub synchronous: bool,
    /// Codec size and filter policy
    pub codec: CodecConfig,
    /// Target filter
    pub filter: TargetFilter,
    /// Unknown target → advertised targets that can serve it
    pub translated_targets: HashMap<String, Vec<String>>,
    /// Targets the peer prefers
    pub preferred_targets: Vec<String>,
    /// Timeout of requests sent to the peer
    pub remote_timeout: Duration,
    /// Token emission debounce delay
    pub emit_delay: Duration,
    /// Owner changes ignored after a claim or an emission
    pub owner_change_embargo: Duration,
    /// Inactivity timeout of incremental native reads
    pub incremental_timeout: Duration,
    /// Limit for a single native call
    pub native_timeout: Duration,
    /// Largest incremental native read
    pub max_incremental_size: usize,
    /// Tell the peer how many requests we wait on
    pub send_pending_requests: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_selections: vec!["CLIPBOARD".to_string(), "PRIMARY".to_string()],
            remote_selections: Vec::new(),
            translation: None,
            can_send: true,
            can_receive: true,
            want_targets: false,
            greedy_client: false,
            greedy: false,
            synchronous: false,
            codec: CodecConfig::default(),
            filter: TargetFilter::default(),
            translated_targets: default_translated_targets(),
            preferred_targets: Vec::new(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            emit_delay: DEFAULT_EMIT_DELAY,
            owner_change_embargo: DEFAULT_OWNER_CHANGE_EMBARGO,
            incremental_timeout: Duration::from_millis(lamco_clipboard_core::DEFAULT_INCREMENTAL_TIMEOUT_MS),
            native_timeout: DEFAULT_NATIVE_TIMEOUT,
            max_incremental_size: lamco_clipboard_core::DEFAULT_MAX_SIZE,
            send_pending_requests: true,
        }
    }
}

impl EngineConfig {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            filter: self.filter.clone(),
            translated_targets: self.translated_targets.clone(),
            emit_delay: self.emit_delay,
            owner_change_embargo: self.owner_change_embargo,
            incremental_timeout: self.incremental_timeout,
            native_timeout: self.native_timeout,
            max_incremental_size: self.max_incremental_size,
        }
    }
}

/// Symmetric local ↔ remote selection name mapping.
///
/// Names without a mapping pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMap {
    pair: Option<(String, String)>,
}

impl NameMap {
    /// Map `local` on this side to `remote` on the peer
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            pair: Some((local.into(), remote.into())),
        }
    }

    /// Identity mapping
    pub fn identity() -> Self {
        Self::default()
    }

    /// Name the peer uses for a local selection
    pub fn to_remote(&self, local: &str) -> String {
        match &self.pair {
            Some((l, r)) if l == local => r.clone(),
            _ => local.to_string(),
        }
    }

    /// Local name for a selection named by the peer
    pub fn to_local(&self, remote: &str) -> String {
        match &self.pair {
            Some((l, r)) if r == remote => l.clone(),
            _ => remote.to_string(),
        }
    }
}

/// Pending request counts, for progress display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Requests we wait on
    pub local_pending: usize,
    /// Requests the peer says it waits on
    pub remote_pending: u8,
}

/// Snapshot of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    /// Per-selection state
    pub selections: Vec<ProxyInfo>,
    /// Selections the peer exposes
    pub remote_selections: Vec<String>,
    /// Ids of requests waiting on the peer
    pub outstanding_requests: Vec<u64>,
    /// Requests sent since start
    pub requests_sent: u64,
    /// Pending counts
    pub progress: Progress,
    /// Outgoing truncation limit
    pub max_send_size: usize,
    /// Incoming truncation limit
    pub max_receive_size: usize,
    /// Largest payload ever sent
    pub max_packet_size: usize,
}

struct ProtocolDispatcher {
    config: EngineConfig,
    proxies: HashMap<String, SelectionProxy>,
    names: NameMap,
    tracker: RequestTracker,
    codec: WireCodec,
    sender: Arc<dyn PacketSender>,
    progress: watch::Sender<Progress>,
    sent_pending: Option<u8>,
}

impl ProtocolDispatcher {
    async fn run(mut self, mut events: EventReceiver, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("Clipboard engine running for {:?}", self.config.local_selections);
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event) {
                        match recovery_action(&e, Direction::Inbound) {
                            RecoveryAction::DropPacket => warn!("Dropping clipboard packet: {}", e),
                            _ => error!("Error handling clipboard event: {}", e),
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Clipboard engine shutting down");
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Packet(packet) => self.handle_packet(packet)?,
            EngineEvent::Wire(values) => self.handle_packet(Packet::from_wire(values)?)?,
            EngineEvent::OwnerChanged { selection } => {
                let actions = self.proxy(&selection)?.owner_changed();
                self.execute(&selection, actions);
            }
            EngineEvent::IncrementalChunk {
                selection,
                transfer_id,
                type_tag,
                data,
            } => {
                let actions = self.proxy(&selection)?.on_chunk(transfer_id, &type_tag, &data);
                self.execute(&selection, actions);
            }
            EngineEvent::TargetsQueried {
                selection,
                query_id,
                result,
            } => {
                let actions = self.proxy(&selection)?.on_targets_queried(query_id, result);
                self.execute(&selection, actions);
            }
            EngineEvent::ContentsRead {
                selection,
                target,
                result,
            } => {
                let actions = self.proxy(&selection)?.on_contents_read(&target, result);
                self.execute(&selection, actions);
            }
            EngineEvent::BackendDone {
                selection,
                operation,
                result,
            } => match result {
                Ok(()) => debug!("{}: native {} done", selection, operation),
                Err(e) => error!("{}: native {} failed: {}", selection, operation, e),
            },
            EngineEvent::LocalRequest {
                selection,
                target,
                reply,
            } => match self.proxies.get_mut(&selection) {
                Some(proxy) => {
                    let actions = proxy.handle_local_request(&target, reply);
                    self.execute(&selection, actions);
                }
                None => {
                    let _ = reply.send(None);
                }
            },
            EngineEvent::Timer(timer) => self.handle_timer(timer)?,
            EngineEvent::Command(command) => self.handle_command(command),
        }
        Ok(())
    }

    fn proxy(&mut self, selection: &str) -> Result<&mut SelectionProxy> {
        self.proxies
            .get_mut(selection)
            .ok_or_else(|| SyncError::UnknownSelection(selection.to_string()))
    }

    // ------------------------------------------------------------------
    // Inbound packets
    // ------------------------------------------------------------------

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        debug!("Received {}", packet);
        match packet {
            Packet::Token {
                selection,
                targets,
                contents,
                claim,
                greedy,
                synchronous,
            } => self.handle_token(&selection, targets, contents, claim, greedy, synchronous),
            Packet::Request {
                request_id,
                selection,
                target,
            } => {
                self.handle_request(request_id, &selection, &target);
                Ok(())
            }
            Packet::Contents {
                request_id,
                selection: _,
                type_tag,
                bit_format,
                payload,
                compress: _,
                truncated,
            } => {
                let Some(entry) = self.tracker.resolve(request_id) else {
                    debug!("Ignoring late or unknown contents for request {}", request_id);
                    return Ok(());
                };
                self.update_progress();
                if truncated > 0 {
                    info!("{} bytes of {} were truncated by the peer", truncated, entry.target);
                }
                let data = match self.decode(&type_tag, bit_format, payload) {
                    Ok(data) => Some(data),
                    Err(e) => {
                        warn!("Invalid contents for request {}: {}", request_id, e);
                        None
                    }
                };
                if let Some(proxy) = self.proxies.get_mut(&entry.selection) {
                    proxy.remote_contents(&entry.target, data);
                }
                Ok(())
            }
            Packet::ContentsNone { request_id, .. } => {
                let Some(entry) = self.tracker.resolve(request_id) else {
                    debug!("Ignoring late or unknown empty reply for request {}", request_id);
                    return Ok(());
                };
                self.update_progress();
                debug!("No {} data for request {}", entry.target, request_id);
                if let Some(proxy) = self.proxies.get_mut(&entry.selection) {
                    proxy.remote_contents(&entry.target, None);
                }
                Ok(())
            }
            Packet::PendingRequests(count) => {
                self.progress.send_modify(|p| p.remote_pending = count);
                Ok(())
            }
            Packet::EnableSelections(selections) => {
                self.enable_selections(&selections);
                Ok(())
            }
        }
    }

    fn handle_token(
        &mut self,
        selection: &str,
        targets: Option<Vec<String>>,
        contents: Option<TokenContents>,
        claim: bool,
        greedy: Option<bool>,
        synchronous: bool,
    ) -> Result<()> {
        let local = self.names.to_local(selection);
        let mut target_data = HashMap::new();
        match contents {
            Some(c) if self.config.filter.must_discard(&c.target) => {
                debug!("Dropping inline {} contents of token for {}", c.target, selection);
            }
            Some(c) => {
                let data = self.decode(&c.type_tag, c.bit_format, c.payload)?;
                target_data.insert(c.target, data);
            }
            None => {}
        }
        let targets = targets.map(|t| self.config.filter.filter(&t));

        let Some(proxy) = self.proxies.get_mut(&local) else {
            debug!("Ignoring token for unknown selection {}", selection);
            return Ok(());
        };
        if !proxy.is_enabled() {
            debug!("Ignoring token for disabled selection {}", local);
            return Ok(());
        }
        if let Some(greedy) = greedy {
            proxy.set_greedy_client(greedy);
        }
        proxy.got_token(targets, target_data, claim, synchronous);
        Ok(())
    }

    fn handle_request(&mut self, request_id: u64, selection: &str, target: &str) {
        let local = self.names.to_local(selection);
        let refusal = match self.proxies.get(&local) {
            None => Some("unknown selection"),
            Some(proxy) if !proxy.is_enabled() => Some("selection disabled"),
            Some(proxy) if !proxy.can_send() => Some("sending disabled"),
            Some(_) if self.config.filter.must_discard(target) => Some("target filtered"),
            Some(_) => None,
        };
        if let Some(reason) = refusal {
            debug!("No data for request {} ({}:{}): {}", request_id, local, target, reason);
            self.send(Packet::ContentsNone {
                request_id,
                selection: selection.to_string(),
            });
            return;
        }
        if let Some(proxy) = self.proxies.get_mut(&local) {
            let actions = proxy.handle_remote_request(request_id, target);
            self.execute(&local, actions);
        }
    }

    fn enable_selections(&mut self, selections: &[String]) {
        let enabled: Vec<String> = selections.iter().map(|s| self.names.to_local(s)).collect();
        info!("Peer enabled selections {:?}", enabled);
        for (name, proxy) in self.proxies.iter_mut() {
            proxy.set_enabled(enabled.contains(name));
        }
    }

    fn decode(&self, type_tag: &str, bit_format: u8, payload: WirePayload) -> Result<TargetData> {
        let format = BitFormat::try_from(bit_format)?;
        let value = self.codec.decode(type_tag, format, payload)?;
        Ok(TargetData {
            type_tag: type_tag.to_string(),
            format,
            value,
        })
    }

    // ------------------------------------------------------------------
    // Timers and commands
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, timer: TimerEvent) -> Result<()> {
        match timer {
            TimerEvent::EmitToken { selection, id } => {
                let actions = self.proxy(&selection)?.on_emit_timer(id);
                self.execute(&selection, actions);
            }
            TimerEvent::IncrementalTimeout { selection, id } => {
                let actions = self.proxy(&selection)?.on_incremental_timeout(id);
                self.execute(&selection, actions);
            }
            TimerEvent::RequestTimeout { request_id } => {
                let Some(entry) = self.tracker.expire(request_id) else {
                    return Ok(());
                };
                warn!(
                    "Request {} for {}:{} timed out after {:?}",
                    request_id,
                    entry.selection,
                    entry.target,
                    self.tracker.timeout()
                );
                self.update_progress();
                if let Some(proxy) = self.proxies.get_mut(&entry.selection) {
                    proxy.remote_contents(&entry.target, None);
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, command: EngineCommand) {
        debug!("Engine command {:?}", command);
        match command {
            EngineCommand::SendTokens(selections) => {
                for selection in selections {
                    self.send_token(&selection);
                }
            }
            EngineCommand::SendAllTokens => {
                let selections: Vec<String> = self.proxies.keys().cloned().collect();
                for selection in selections {
                    self.send_token(&selection);
                }
            }
            EngineCommand::ClaimAll => {
                for proxy in self.proxies.values_mut() {
                    proxy.claim();
                }
            }
            EngineCommand::ClientReset => {
                for entry in self.tracker.drain() {
                    debug!("Dropping request {} on reset", entry.request_id);
                }
                self.update_progress();
                let selections: Vec<String> = self.proxies.keys().cloned().collect();
                for selection in selections {
                    if let Some(proxy) = self.proxies.get_mut(&selection) {
                        let actions = proxy.reset();
                        self.execute(&selection, actions);
                    }
                }
                self.progress.send_modify(|p| p.remote_pending = 0);
            }
            EngineCommand::SetDirection { can_send, can_receive } => {
                info!("Clipboard direction: send={}, receive={}", can_send, can_receive);
                self.config.can_send = can_send;
                self.config.can_receive = can_receive;
                for proxy in self.proxies.values_mut() {
                    proxy.set_direction(can_send, can_receive);
                }
            }
            EngineCommand::SetLimits {
                max_send_size,
                max_receive_size,
            } => self.codec.set_limits(max_send_size, max_receive_size),
            EngineCommand::EnableSelections(selections) => self.enable_selections(&selections),
            EngineCommand::SetGreedyClient(greedy) => {
                for proxy in self.proxies.values_mut() {
                    proxy.set_greedy_client(greedy);
                }
            }
            EngineCommand::SetWantTargets(want_targets) => {
                for proxy in self.proxies.values_mut() {
                    proxy.set_want_targets(want_targets);
                }
            }
            EngineCommand::SetPreferredTargets(targets) => {
                for proxy in self.proxies.values_mut() {
                    proxy.set_preferred_targets(targets.clone());
                }
            }
            EngineCommand::Info(reply) => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn send_token(&mut self, selection: &str) {
        match self.proxies.get_mut(selection) {
            Some(proxy) if proxy.is_enabled() => {
                let actions = proxy.emit_token();
                self.execute(selection, actions);
            }
            Some(_) => debug!("Not sending token for disabled selection {}", selection),
            None => warn!("Cannot send token for unknown selection {}", selection),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn execute(&mut self, selection: &str, actions: Vec<ProxyAction>) {
        for action in actions {
            match action {
                ProxyAction::SendToken {
                    targets,
                    contents,
                    claim,
                } => {
                    let targets = targets.map(|t| self.config.filter.filter(&t));
                    let contents = contents.and_then(|(target, data)| self.token_contents(target, data));
                    self.send(Packet::Token {
                        selection: self.names.to_remote(selection),
                        targets,
                        contents,
                        claim,
                        greedy: Some(self.config.greedy),
                        synchronous: self.config.synchronous,
                    });
                }
                ProxyAction::Reply {
                    request_id,
                    target,
                    data,
                } => self.reply(selection, request_id, &target, data),
                ProxyAction::RequestRemote { target } => {
                    let request_id = self.tracker.request(selection, &target);
                    self.send(Packet::Request {
                        request_id,
                        selection: self.names.to_remote(selection),
                        target,
                    });
                    self.update_progress();
                }
            }
        }
    }

    fn token_contents(&self, target: String, data: TargetData) -> Option<TokenContents> {
        if self.config.filter.must_discard(&target) {
            debug!("Not sending {} contents with the token", target);
            return None;
        }
        match self.codec.prepare_send(&target, data) {
            Ok(PreparedContents::Ready(encoded)) => Some(TokenContents {
                target,
                type_tag: encoded.type_tag,
                bit_format: encoded.format.into(),
                payload: encoded.payload,
                compress: encoded.compress,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("Cannot send {} contents with the token: {}", target, e);
                None
            }
        }
    }

    fn reply(&mut self, selection: &str, request_id: u64, target: &str, data: Option<TargetData>) {
        let remote = self.names.to_remote(selection);
        let prepared = match data {
            Some(data) => self.codec.prepare_send(target, data),
            None => Ok(PreparedContents::Dropped),
        };
        match prepared {
            Ok(PreparedContents::Ready(encoded)) => self.send(Packet::Contents {
                request_id,
                selection: remote,
                type_tag: encoded.type_tag,
                bit_format: encoded.format.into(),
                payload: encoded.payload,
                compress: encoded.compress,
                truncated: encoded.truncated,
            }),
            Ok(PreparedContents::Dropped) => self.send(Packet::ContentsNone {
                request_id,
                selection: remote,
            }),
            Ok(PreparedContents::Rejected { size, max }) => {
                debug!("Request {} not answered: {} bytes over the {} limit", request_id, size, max);
            }
            Err(e) => {
                warn!("Cannot encode {} for request {}: {}", target, request_id, e);
                self.send(Packet::ContentsNone {
                    request_id,
                    selection: remote,
                });
            }
        }
    }

    fn send(&self, packet: Packet) {
        debug!("Sending {}", packet);
        self.sender.send(packet);
    }

    fn update_progress(&mut self) {
        let pending = self.tracker.len();
        self.progress.send_if_modified(|p| {
            let changed = p.local_pending != pending;
            p.local_pending = pending;
            changed
        });
        if !self.config.send_pending_requests {
            return;
        }
        let count = u8::try_from(pending).unwrap_or(u8::MAX);
        if self.sent_pending != Some(count) {
            self.sent_pending = Some(count);
            self.send(Packet::PendingRequests(count));
        }
    }

    fn info(&self) -> EngineInfo {
        let mut selections: Vec<ProxyInfo> = self.proxies.values().map(SelectionProxy::info).collect();
        selections.sort_by(|a, b| a.selection.cmp(&b.selection));
        let codec = self.codec.config();
        EngineInfo {
            selections,
            remote_selections: self.config.remote_selections.clone(),
            outstanding_requests: self.tracker.pending_ids(),
            requests_sent: self.tracker.total(),
            progress: *self.progress.borrow(),
            max_send_size: codec.max_send_size,
            max_receive_size: codec.max_receive_size,
            max_packet_size: codec.max_packet_size,
        }
    }

    async fn shutdown(&mut self) {
        let drained = self.tracker.drain();
        if !drained.is_empty() {
            info!("Answering {} outstanding request(s) with no data", drained.len());
        }
        for entry in drained {
            if let Some(proxy) = self.proxies.get_mut(&entry.selection) {
                proxy.remote_contents(&entry.target, None);
            }
        }
        self.update_progress();

        let selections: Vec<String> = self.proxies.keys().cloned().collect();
        for selection in selections {
            if let Some(proxy) = self.proxies.get_mut(&selection) {
                let actions = proxy.cleanup();
                self.execute(&selection, actions);
            }
        }
        for proxy in self.proxies.values() {
            proxy.detach().await;
        }
        info!("Clipboard engine stopped");
    }
}

/// Cloneable handle for talking to a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    events: EventSender,
    progress: watch::Receiver<Progress>,
}

impl EngineHandle {
    fn post(&self, event: EngineEvent) -> Result<()> {
        self.events.send(event).map_err(|_| SyncError::EngineStopped)
    }

    fn command(&self, command: EngineCommand) -> Result<()> {
        self.post(EngineEvent::Command(command))
    }

    /// Deliver a packet from the peer
    pub fn handle_packet(&self, packet: Packet) -> Result<()> {
        self.post(EngineEvent::Packet(packet))
    }

    /// Deliver a positional packet from a byte-level transport
    pub fn handle_wire(&self, values: Vec<WireValue>) -> Result<()> {
        self.post(EngineEvent::Wire(values))
    }

    /// Emit tokens for these local selections
    pub fn send_tokens(&self, selections: Vec<String>) -> Result<()> {
        self.command(EngineCommand::SendTokens(selections))
    }

    /// Emit tokens for every selection
    pub fn send_all_tokens(&self) -> Result<()> {
        self.command(EngineCommand::SendAllTokens)
    }

    /// Take native ownership of every selection
    pub fn claim_all(&self) -> Result<()> {
        self.command(EngineCommand::ClaimAll)
    }

    /// Forget everything learned from the peer
    pub fn client_reset(&self) -> Result<()> {
        self.command(EngineCommand::ClientReset)
    }

    /// Change the transfer direction
    pub fn set_direction(&self, can_send: bool, can_receive: bool) -> Result<()> {
        self.command(EngineCommand::SetDirection { can_send, can_receive })
    }

    /// Change the truncation limits (0 disables)
    pub fn set_limits(&self, max_send_size: usize, max_receive_size: usize) -> Result<()> {
        self.command(EngineCommand::SetLimits {
            max_send_size,
            max_receive_size,
        })
    }

    /// Enable exactly these selections, named as the peer names them
    pub fn enable_selections(&self, selections: Vec<String>) -> Result<()> {
        self.command(EngineCommand::EnableSelections(selections))
    }

    /// Peer wants a token, with contents, on every owner change
    pub fn set_greedy_client(&self, greedy: bool) -> Result<()> {
        self.command(EngineCommand::SetGreedyClient(greedy))
    }

    /// Peer wants target lists in tokens
    pub fn set_want_targets(&self, want_targets: bool) -> Result<()> {
        self.command(EngineCommand::SetWantTargets(want_targets))
    }

    /// Targets the peer prefers
    pub fn set_preferred_targets(&self, targets: Vec<String>) -> Result<()> {
        self.command(EngineCommand::SetPreferredTargets(targets))
    }

    /// A native application took ownership of `selection`
    pub fn owner_changed(&self, selection: impl Into<String>) -> Result<()> {
        self.post(EngineEvent::OwnerChanged {
            selection: selection.into(),
        })
    }

    /// Ask the peer for `target` of `selection`, as a native client would
    pub async fn request_contents(&self, selection: &str, target: &str) -> Result<Option<TargetData>> {
        let ctx = BackendContext::new(selection, self.events.clone());
        if self.events.is_closed() {
            return Err(SyncError::EngineStopped);
        }
        Ok(ctx.request_contents(target).await)
    }

    /// Snapshot of the engine state
    pub async fn info(&self) -> Result<EngineInfo> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::Info(reply))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Pending request counts
    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }
}

/// Running clipboard engine
#[derive(Debug)]
pub struct ClipboardEngine {
    handle: EngineHandle,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ClipboardEngine {
    /// Attach the backends and start the engine loop.
    ///
    /// A selection whose backend is missing or fails to attach stays inert.
    pub async fn start(
        config: EngineConfig,
        sender: Arc<dyn PacketSender>,
        factory: &dyn BackendFactory,
    ) -> Result<Self> {
        if config.local_selections.is_empty() {
            return Err(SyncError::Config("no local selections configured".to_string()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut proxies = HashMap::new();
        for selection in &config.local_selections {
            let backend = match factory.create(selection) {
                Some(backend) => match backend.attach(BackendContext::new(selection, events_tx.clone())).await {
                    Ok(()) => Some(backend),
                    Err(e) => {
                        error!("Failed to attach backend for {}: {}", selection, e);
                        None
                    }
                },
                None => None,
            };
            let mut proxy = SelectionProxy::new(selection, backend, events_tx.clone(), config.proxy_config());
            proxy.set_direction(config.can_send, config.can_receive);
            proxy.set_greedy_client(config.greedy_client);
            proxy.set_want_targets(config.want_targets);
            proxy.set_preferred_targets(config.preferred_targets.clone());
            proxies.insert(selection.clone(), proxy);
        }

        let names = match &config.translation {
            Some((local, remote)) => NameMap::new(local, remote),
            None => NameMap::identity(),
        };
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let dispatcher = ProtocolDispatcher {
            tracker: RequestTracker::new(config.remote_timeout, events_tx.clone()),
            codec: WireCodec::new(config.codec.clone(), config.filter.clone()),
            config,
            proxies,
            names,
            sender,
            progress: progress_tx,
            sent_pending: None,
        };
        let task = tokio::spawn(dispatcher.run(events_rx, shutdown_rx));

        Ok(Self {
            handle: EngineHandle {
                events: events_tx,
                progress: progress_rx,
            },
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Handle for delivering packets and commands
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the engine: outstanding requests resolve with no data and the
    /// backends are detached.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down clipboard engine");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| SyncError::Backend(format!("engine task failed: {}", e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::backend::NoBackend;
    use crate::clipboard::memory::InMemoryClipboard;
    use crate::clipboard::transport::ChannelSender;
    use lamco_clipboard_core::SelectionValue;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn start_engine(
        config: EngineConfig,
        clipboard: &InMemoryClipboard,
    ) -> (ClipboardEngine, UnboundedReceiver<Packet>) {
        let (sender, rx) = ChannelSender::new();
        let engine = ClipboardEngine::start(config, Arc::new(sender), clipboard).await.unwrap();
        (engine, rx)
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            local_selections: vec!["CLIPBOARD".to_string()],
            send_pending_requests: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_name_map() {
        let names = NameMap::new("CLIPBOARD", "PRIMARY");
        assert_eq!(names.to_remote("CLIPBOARD"), "PRIMARY");
        assert_eq!(names.to_local("PRIMARY"), "CLIPBOARD");
        assert_eq!(names.to_remote("SECONDARY"), "SECONDARY");
        assert_eq!(names.to_local("SECONDARY"), "SECONDARY");

        let identity = NameMap::identity();
        assert_eq!(identity.to_remote("CLIPBOARD"), "CLIPBOARD");
    }

    #[tokio::test]
    async fn test_start_requires_selections() {
        let (sender, _rx) = ChannelSender::new();
        let config = EngineConfig {
            local_selections: Vec::new(),
            ..Default::default()
        };
        let result = ClipboardEngine::start(config, Arc::new(sender), &NoBackend).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_selection_request_answers_no_data() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        engine
            .handle()
            .handle_packet(Packet::Request {
                request_id: 3,
                selection: "SECONDARY".to_string(),
                target: "TEXT".to_string(),
            })
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Packet::ContentsNone {
                request_id: 3,
                selection: "SECONDARY".to_string()
            })
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_filtered_target_request_answers_no_data() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        clipboard
            .backend("CLIPBOARD")
            .unwrap()
            .set_contents(vec![("com.apple.pasteboard".to_string(), TargetData::text("x"))]);
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        engine
            .handle()
            .handle_packet(Packet::Request {
                request_id: 1,
                selection: "CLIPBOARD".to_string(),
                target: "com.apple.pasteboard".to_string(),
            })
            .unwrap();
        assert!(matches!(rx.recv().await, Some(Packet::ContentsNone { request_id: 1, .. })));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_answered_from_native_clipboard() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        clipboard.backend("CLIPBOARD").unwrap().copy_text("hello");
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        engine
            .handle()
            .handle_packet(Packet::Request {
                request_id: 5,
                selection: "CLIPBOARD".to_string(),
                target: "UTF8_STRING".to_string(),
            })
            .unwrap();
        match rx.recv().await {
            Some(Packet::Contents {
                request_id,
                type_tag,
                bit_format,
                payload,
                truncated,
                ..
            }) => {
                assert_eq!(request_id, 5);
                assert_eq!(type_tag, "UTF8_STRING");
                assert_eq!(bit_format, 8);
                assert_eq!(payload, WirePayload::Bytes(b"hello".to_vec()));
                assert_eq!(truncated, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_targets_request_is_filtered() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        clipboard.backend("CLIPBOARD").unwrap().set_contents(vec![
            ("UTF8_STRING".to_string(), TargetData::text("x")),
            ("x-special/gnome-copied-files".to_string(), TargetData::text("file:///etc")),
        ]);
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        engine
            .handle()
            .handle_packet(Packet::Request {
                request_id: 2,
                selection: "CLIPBOARD".to_string(),
                target: "TARGETS".to_string(),
            })
            .unwrap();
        match rx.recv().await {
            Some(Packet::Contents { payload, .. }) => {
                assert_eq!(payload, WirePayload::Atoms(vec!["UTF8_STRING".to_string()]));
            }
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_wire_packet_is_dropped() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        let handle = engine.handle();
        handle
            .handle_wire(vec![WireValue::Str("clipboard-request".to_string()), WireValue::Bool(true)])
            .unwrap();
        handle
            .handle_wire(vec![WireValue::Str("clipboard-bogus".to_string())])
            .unwrap();
        // the engine is still alive
        let info = handle.info().await.unwrap();
        assert_eq!(info.selections.len(), 1);
        assert!(rx.try_recv().is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_with_contents_claims_selection() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let (mut engine, _rx) = start_engine(quiet_config(), &clipboard).await;
        let handle = engine.handle();
        handle
            .handle_packet(Packet::Token {
                selection: "CLIPBOARD".to_string(),
                targets: Some(vec!["UTF8_STRING".to_string()]),
                contents: Some(TokenContents {
                    target: "UTF8_STRING".to_string(),
                    type_tag: "UTF8_STRING".to_string(),
                    bit_format: 8,
                    payload: WirePayload::Bytes(b"inline".to_vec()),
                    compress: false,
                }),
                claim: true,
                greedy: Some(true),
                synchronous: false,
            })
            .unwrap();

        let info = handle.info().await.unwrap();
        let proxy = &info.selections[0];
        assert!(proxy.have_token);
        assert!(proxy.greedy_client);
        assert_eq!(proxy.targets, vec!["UTF8_STRING".to_string()]);

        let data = handle.request_contents("CLIPBOARD", "UTF8_STRING").await.unwrap().unwrap();
        assert_eq!(data.value, SelectionValue::Bytes(b"inline".to_vec()));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_drops_discarded_inline_contents() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let (mut engine, _rx) = start_engine(quiet_config(), &clipboard).await;
        let handle = engine.handle();
        let promised = "com.apple.pasteboard.promised-file-url";
        handle
            .handle_packet(Packet::Token {
                selection: "CLIPBOARD".to_string(),
                targets: Some(vec!["UTF8_STRING".to_string()]),
                contents: Some(TokenContents {
                    target: promised.to_string(),
                    type_tag: promised.to_string(),
                    bit_format: 8,
                    payload: WirePayload::Bytes(b"file:///tmp/x".to_vec()),
                    compress: false,
                }),
                claim: true,
                greedy: None,
                synchronous: false,
            })
            .unwrap();

        let info = handle.info().await.unwrap();
        assert_eq!(info.selections[0].targets, vec!["UTF8_STRING".to_string()]);

        let backend = clipboard.backend("CLIPBOARD").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !backend.is_owned() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(backend.advertised_targets(), vec!["UTF8_STRING".to_string()]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_requests_are_reported() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let config = EngineConfig {
            local_selections: vec!["CLIPBOARD".to_string()],
            ..Default::default()
        };
        let (mut engine, mut rx) = start_engine(config, &clipboard).await;
        let handle = engine.handle();
        handle.handle_packet(Packet::token("CLIPBOARD", Some(vec!["TEXT".to_string()]))).unwrap();

        let requester = handle.clone();
        let paste = tokio::spawn(async move { requester.request_contents("CLIPBOARD", "TEXT").await });

        let request_id = match rx.recv().await {
            Some(Packet::Request { request_id, target, .. }) => {
                assert_eq!(target, "TEXT");
                request_id
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rx.recv().await, Some(Packet::PendingRequests(1)));
        let mut progress = handle.progress();
        progress.wait_for(|p| p.local_pending == 1).await.unwrap();

        handle
            .handle_packet(Packet::ContentsNone {
                request_id,
                selection: "CLIPBOARD".to_string(),
            })
            .unwrap();
        assert_eq!(rx.recv().await, Some(Packet::PendingRequests(0)));
        assert_eq!(paste.await.unwrap().unwrap(), None);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_answers_outstanding_requests() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        let (mut engine, mut rx) = start_engine(quiet_config(), &clipboard).await;
        let handle = engine.handle();
        handle.handle_packet(Packet::token("CLIPBOARD", Some(vec!["TEXT".to_string()]))).unwrap();

        let requester = handle.clone();
        let paste = tokio::spawn(async move { requester.request_contents("CLIPBOARD", "TEXT").await });
        assert!(matches!(rx.recv().await, Some(Packet::Request { .. })));

        engine.shutdown().await.unwrap();
        assert_eq!(paste.await.unwrap().unwrap(), None);
        assert!(handle.info().await.is_err());
    }

    #[tokio::test]
    async fn test_name_translation_applies_both_ways() {
        let clipboard = InMemoryClipboard::new(["CLIPBOARD"]);
        clipboard.backend("CLIPBOARD").unwrap().copy_text("mapped");
        let config = EngineConfig {
            translation: Some(("CLIPBOARD".to_string(), "PRIMARY".to_string())),
            ..quiet_config()
        };
        let (mut engine, mut rx) = start_engine(config, &clipboard).await;
        engine
            .handle()
            .handle_packet(Packet::Request {
                request_id: 1,
                selection: "PRIMARY".to_string(),
                target: "UTF8_STRING".to_string(),
            })
            .unwrap();
        match rx.recv().await {
            Some(Packet::Contents { selection, .. }) => assert_eq!(selection, "PRIMARY"),
            other => panic!("unexpected {:?}", other),
        }
        engine.shutdown().await.unwrap();
    }
}
