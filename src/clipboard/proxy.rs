//! Selection Proxy
//!
//! One proxy per selection, owned by the engine loop. The proxy decides who
//! holds the token for its selection, caches what the peer told it, and
//! answers content requests from both sides.
//!
//! # States
//!
//! ```text
//!   Disabled ──set_enabled(true)──▶ Enabled·NoToken ◀──emit_token── Enabled·HaveToken
//!                                        │                                  ▲
//!                                        └──────got_token(claim=true)───────┘
//! ```
//!
//! `have_token` means the peer's data is what the native selection shows:
//! we own the native selection on the peer's behalf. Emitting a token hands
//! that role to the peer.
//!
//! The proxy never awaits the backend. Native calls are spawned and their
//! completions come back as events; every handler returns the
//! [`ProxyAction`]s the dispatcher has to carry out.

use lamco_clipboard_core::targets::IMAGE_TARGETS;
use lamco_clipboard_core::{
    is_text_target, BitFormat, ChunkOutcome, IncrementalTransfer, SelectionValue, TargetData, TargetFilter, TARGETS,
    TEXT_TARGETS,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clipboard::backend::{ReadOutcome, SelectionBackend};
use crate::clipboard::error::{Result, SyncError};
use crate::clipboard::event::{EngineEvent, EventSender, TimerEvent};
use crate::clipboard::timer::{ScheduledTask, TimerIds};

/// Minimum delay between two debounced token emissions
pub const DEFAULT_EMIT_DELAY: Duration = Duration::from_millis(100);

/// Owner changes right after we claimed or emitted are our own echo
pub const DEFAULT_OWNER_CHANGE_EMBARGO: Duration = Duration::from_millis(100);

/// Limit for a single native call
pub const DEFAULT_NATIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-proxy settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Target filter
    pub filter: TargetFilter,
    /// Unknown target → advertised targets that can serve it
    pub translated_targets: HashMap<String, Vec<String>>,
    /// Debounce delay for token emission
    pub emit_delay: Duration,
    /// Window during which owner changes are ignored
    pub owner_change_embargo: Duration,
    /// Inactivity timeout of incremental reads
    pub incremental_timeout: Duration,
    /// Limit for a single native call
    pub native_timeout: Duration,
    /// Largest incremental read accepted (0 disables)
    pub max_incremental_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            filter: TargetFilter::default(),
            translated_targets: default_translated_targets(),
            emit_delay: DEFAULT_EMIT_DELAY,
            owner_change_embargo: DEFAULT_OWNER_CHANGE_EMBARGO,
            incremental_timeout: Duration::from_millis(lamco_clipboard_core::DEFAULT_INCREMENTAL_TIMEOUT_MS),
            native_timeout: DEFAULT_NATIVE_TIMEOUT,
            max_incremental_size: lamco_clipboard_core::DEFAULT_MAX_SIZE,
        }
    }
}

/// Built-in target translations
pub fn default_translated_targets() -> HashMap<String, Vec<String>> {
    lamco_clipboard_core::targets::DEFAULT_TRANSLATED_TARGETS
        .iter()
        .map(|(from, to)| (from.to_string(), vec![to.to_string()]))
        .collect()
}

/// Work the dispatcher carries out for a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAction {
    /// Send a `clipboard-token`
    SendToken {
        /// Local targets, unfiltered
        targets: Option<Vec<String>>,
        /// Contents to inline, keyed by target
        contents: Option<(String, TargetData)>,
        /// Peer should claim its native selection
        claim: bool,
    },
    /// Answer a `clipboard-request` from the peer
    Reply {
        /// Peer's request id
        request_id: u64,
        /// Requested target
        target: String,
        /// Contents, `None` for "no data"
        data: Option<TargetData>,
    },
    /// Ask the peer for contents
    RequestRemote {
        /// Target to request
        target: String,
    },
}

/// Who is waiting for a native read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeWaiter {
    /// A peer request
    Remote(u64),
    /// A token emission being assembled
    Token,
}

/// Stage of a token emission waiting on the native side
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingToken {
    Targets,
    Contents(String),
}

/// Native TARGETS query in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetsQuery {
    id: u64,
    /// Owner generation the query was started in
    generation: u64,
}

/// A native client waiting for peer contents
#[derive(Debug)]
struct LocalWaiter {
    requested: String,
    reply: oneshot::Sender<Option<TargetData>>,
}

#[derive(Debug)]
struct IncrementalRead {
    transfer_id: u64,
    transfer: IncrementalTransfer,
    format: BitFormat,
    waiters: Vec<NativeWaiter>,
    timer: ScheduledTask,
}

/// Event counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyCounters {
    /// Tokens sent to the peer
    pub tokens_sent: u64,
    /// Tokens received from the peer
    pub tokens_received: u64,
    /// Peer requests for local contents
    pub remote_requests: u64,
    /// Native requests for peer contents
    pub local_requests: u64,
    /// Native owner changes acted upon
    pub owner_changes: u64,
}

/// Snapshot of a proxy
#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    /// Local selection name
    pub selection: String,
    /// Has a native backend
    pub has_backend: bool,
    /// Selection is synchronized
    pub enabled: bool,
    /// We own the native selection for the peer
    pub have_token: bool,
    /// Local contents may be sent
    pub can_send: bool,
    /// Peer contents may be received
    pub can_receive: bool,
    /// Peer wants a token on every change
    pub greedy_client: bool,
    /// Peer wants target lists
    pub want_targets: bool,
    /// Owner changes are currently ignored
    pub owner_change_embargo: bool,
    /// A token emission is scheduled
    pub emit_scheduled: bool,
    /// Cached target list
    pub targets: Vec<String>,
    /// Native clients waiting on the peer
    pub pending_local: usize,
    /// Native reads in flight
    pub pending_native: usize,
    /// Progress of the incremental read, in percent
    pub incremental_progress: Option<f64>,
    /// Counters
    pub counters: ProxyCounters,
}

/// State machine for one selection
pub struct SelectionProxy {
    selection: String,
    backend: Option<Arc<dyn SelectionBackend>>,
    events: EventSender,
    config: ProxyConfig,

    enabled: bool,
    have_token: bool,
    can_send: bool,
    can_receive: bool,
    greedy_client: bool,
    want_targets: bool,
    preferred_targets: Vec<String>,

    targets: Vec<String>,
    target_data: HashMap<String, TargetData>,

    embargo_until: Option<Instant>,
    last_emit: Option<Instant>,
    emit_timer: Option<ScheduledTask>,
    pending_token: Option<PendingToken>,

    native_reads: HashMap<String, Vec<NativeWaiter>>,
    owner_generation: u64,
    targets_query: Option<TargetsQuery>,
    next_query_id: u64,
    local_waiters: HashMap<String, Vec<LocalWaiter>>,
    incremental: Option<IncrementalRead>,

    timer_ids: TimerIds,
    counters: ProxyCounters,
}

impl std::fmt::Debug for SelectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionProxy")
            .field("selection", &self.selection)
            .field("enabled", &self.enabled)
            .field("have_token", &self.have_token)
            .field("targets", &self.targets)
            .finish()
    }
}

impl SelectionProxy {
    /// Create a proxy. Without a backend it stays disabled for good.
    pub fn new(
        selection: impl Into<String>,
        backend: Option<Arc<dyn SelectionBackend>>,
        events: EventSender,
        config: ProxyConfig,
    ) -> Self {
        let selection = selection.into();
        if backend.is_none() {
            warn!("No backend for selection {}, it will not be synchronized", selection);
        }
        Self {
            enabled: backend.is_some(),
            selection,
            backend,
            events,
            config,
            have_token: false,
            can_send: true,
            can_receive: true,
            greedy_client: false,
            want_targets: false,
            preferred_targets: Vec::new(),
            targets: Vec::new(),
            target_data: HashMap::new(),
            embargo_until: None,
            last_emit: None,
            emit_timer: None,
            pending_token: None,
            native_reads: HashMap::new(),
            owner_generation: 0,
            targets_query: None,
            next_query_id: 1,
            local_waiters: HashMap::new(),
            incremental: None,
            timer_ids: TimerIds::default(),
            counters: ProxyCounters::default(),
        }
    }

    /// Local selection name
    pub fn selection(&self) -> &str {
        &self.selection
    }

    /// Selection is synchronized
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// We own the native selection for the peer
    pub fn have_token(&self) -> bool {
        self.have_token
    }

    /// Local contents may be sent
    pub fn can_send(&self) -> bool {
        self.can_send
    }

    /// Peer contents may be received
    pub fn can_receive(&self) -> bool {
        self.can_receive
    }

    /// Cached target list
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Cached contents received inline with a token
    pub fn cached_data(&self, target: &str) -> Option<&TargetData> {
        self.target_data.get(target)
    }

    /// Enable or mute the selection. A proxy without backend stays disabled.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && self.backend.is_none() {
            debug!("{}: cannot enable without a backend", self.selection);
            return;
        }
        if self.enabled != enabled {
            info!("Selection {} {}", self.selection, if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    /// Change the transfer direction
    pub fn set_direction(&mut self, can_send: bool, can_receive: bool) {
        self.can_send = can_send;
        self.can_receive = can_receive;
    }

    /// Peer wants a token, with contents, on every owner change
    pub fn set_greedy_client(&mut self, greedy: bool) {
        self.greedy_client = greedy;
    }

    /// Peer wants target lists in tokens
    pub fn set_want_targets(&mut self, want_targets: bool) {
        self.want_targets = want_targets;
    }

    /// Targets the peer prefers
    pub fn set_preferred_targets(&mut self, targets: Vec<String>) {
        self.preferred_targets = targets;
    }

    // ------------------------------------------------------------------
    // Token handling
    // ------------------------------------------------------------------

    /// A native application took ownership of the selection
    pub fn owner_changed(&mut self) -> Vec<ProxyAction> {
        if !self.enabled {
            return Vec::new();
        }
        if self.embargoed() {
            debug!("{}: ignoring owner change during embargo", self.selection);
            return Vec::new();
        }
        debug!(
            "{}: owner changed, have_token={}, greedy={}, want_targets={}, can_send={}",
            self.selection, self.have_token, self.greedy_client, self.want_targets, self.can_send
        );
        self.counters.owner_changes += 1;
        self.owner_generation += 1;
        self.targets.clear();
        self.target_data.clear();
        if self.have_token || ((self.greedy_client || self.want_targets) && self.can_send) {
            self.schedule_emit_token()
        } else {
            Vec::new()
        }
    }

    /// Emit a token now or after the debounce delay.
    ///
    /// Any emission already scheduled is replaced.
    pub fn schedule_emit_token(&mut self) -> Vec<ProxyAction> {
        self.cancel_emit_token();
        if self.have_token || !(self.want_targets || self.greedy_client) {
            return self.emit_token();
        }
        let elapsed = self.last_emit.map_or(Duration::MAX, |t| t.elapsed());
        if elapsed >= self.config.emit_delay {
            return self.emit_token();
        }
        let delay = self.config.emit_delay - elapsed;
        let id = self.timer_ids.next_id();
        debug!("{}: token emission in {:?}", self.selection, delay);
        self.emit_timer = Some(ScheduledTask::schedule(
            id,
            delay,
            self.events.clone(),
            EngineEvent::Timer(TimerEvent::EmitToken {
                selection: self.selection.clone(),
                id,
            }),
        ));
        Vec::new()
    }

    /// The debounce timer fired
    pub fn on_emit_timer(&mut self, id: u64) -> Vec<ProxyAction> {
        match &self.emit_timer {
            Some(task) if task.id() == id => {
                self.emit_timer = None;
                self.emit_token()
            }
            _ => {
                debug!("{}: stale emit timer {}", self.selection, id);
                Vec::new()
            }
        }
    }

    /// Hand the token to the peer
    pub fn emit_token(&mut self) -> Vec<ProxyAction> {
        self.cancel_emit_token();
        self.arm_embargo();
        self.have_token = false;
        self.last_emit = Some(Instant::now());
        self.counters.tokens_sent += 1;

        if !(self.want_targets || self.greedy_client) {
            self.pending_token = None;
            return vec![self.token_action(None, None)];
        }
        if !self.targets.is_empty() || self.backend.is_none() {
            return self.continue_token_with_targets();
        }
        self.pending_token = Some(PendingToken::Targets);
        self.query_targets(NativeWaiter::Token);
        Vec::new()
    }

    fn continue_token_with_targets(&mut self) -> Vec<ProxyAction> {
        if !self.greedy_client {
            return self.finish_token(None);
        }
        let chosen = choose_targets(&self.targets, &self.preferred_targets);
        debug!("{}: chosen targets {:?}", self.selection, chosen);
        let Some(target) = chosen.into_iter().next() else {
            return self.finish_token(None);
        };
        if let Some(data) = self.target_data.get(&target).cloned() {
            return self.finish_token(Some((target, data)));
        }
        if self.backend.is_none() {
            return self.finish_token(None);
        }
        self.pending_token = Some(PendingToken::Contents(target.clone()));
        self.read_native(&target, NativeWaiter::Token);
        Vec::new()
    }

    fn finish_token(&mut self, contents: Option<(String, TargetData)>) -> Vec<ProxyAction> {
        self.pending_token = None;
        vec![self.token_action(Some(self.targets.clone()), contents)]
    }

    fn token_action(&self, targets: Option<Vec<String>>, contents: Option<(String, TargetData)>) -> ProxyAction {
        ProxyAction::SendToken {
            targets,
            contents,
            claim: self.can_send,
        }
    }

    /// The peer now owns the selection
    pub fn got_token(
        &mut self,
        targets: Option<Vec<String>>,
        target_data: HashMap<String, TargetData>,
        claim: bool,
        synchronous: bool,
    ) {
        self.cancel_emit_token();
        self.pending_token = None;
        if !self.enabled {
            return;
        }
        self.counters.tokens_received += 1;
        debug!(
            "{}: got token, targets={:?}, inline={:?}, claim={}, can_receive={}",
            self.selection,
            targets,
            target_data.keys().collect::<Vec<_>>(),
            claim,
            self.can_receive
        );
        if claim {
            self.have_token = true;
        }
        if !self.can_receive {
            return;
        }

        let mut targets = targets.unwrap_or_default();
        let mut inline: Vec<&String> = target_data.keys().collect();
        inline.sort();
        for target in inline {
            if !targets.contains(target) {
                targets.push(target.clone());
            }
        }
        self.targets = targets;
        self.target_data = target_data;

        if !claim {
            return;
        }
        if !self.targets.is_empty() {
            let list = TargetData::targets(self.targets.clone());
            self.answer_local(TARGETS, Some(list));
        }
        if synchronous {
            let text = TEXT_TARGETS
                .iter()
                .find(|t| self.target_data.contains_key(**t))
                .and_then(|t| self.target_data.get(*t).map(|d| (t.to_string(), d.clone())));
            if let Some((target, data)) = text {
                self.write_native(target, data);
            }
        }
        self.claim();
    }

    /// Take native ownership on behalf of the peer
    pub fn claim(&mut self) {
        if !self.enabled {
            return;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        self.have_token = true;
        self.arm_embargo();
        let targets = self.targets.clone();
        self.spawn_backend_call("claim", async move { backend.claim_ownership(targets).await });
    }

    fn cancel_emit_token(&mut self) {
        if let Some(mut task) = self.emit_timer.take() {
            task.cancel();
        }
    }

    fn arm_embargo(&mut self) {
        self.embargo_until = Some(Instant::now() + self.config.owner_change_embargo);
    }

    fn embargoed(&self) -> bool {
        self.embargo_until.is_some_and(|until| Instant::now() < until)
    }

    // ------------------------------------------------------------------
    // Peer asks for local contents
    // ------------------------------------------------------------------

    /// Answer a peer request for `target`.
    ///
    /// The dispatcher has already checked `enabled`, `can_send` and the
    /// target filter.
    pub fn handle_remote_request(&mut self, request_id: u64, target: &str) -> Vec<ProxyAction> {
        self.counters.remote_requests += 1;
        self.get_contents(target, NativeWaiter::Remote(request_id))
    }

    fn get_contents(&mut self, target: &str, waiter: NativeWaiter) -> Vec<ProxyAction> {
        if target == TARGETS && !self.targets.is_empty() {
            let list = TargetData::targets(self.targets.clone());
            return self.deliver(waiter, TARGETS, Some(list));
        }
        if let Some(data) = self.target_data.get(target).cloned() {
            return self.deliver(waiter, target, Some(data));
        }
        if self.have_token || self.backend.is_none() {
            // the native selection is ours, reading it would read the peer's token
            debug!("{}: no local contents for {}", self.selection, target);
            return self.deliver(waiter, target, None);
        }
        if target == TARGETS {
            self.query_targets(waiter);
        } else {
            self.read_native(target, waiter);
        }
        Vec::new()
    }

    fn deliver(&mut self, waiter: NativeWaiter, target: &str, data: Option<TargetData>) -> Vec<ProxyAction> {
        match waiter {
            NativeWaiter::Remote(request_id) => vec![ProxyAction::Reply {
                request_id,
                target: target.to_string(),
                data,
            }],
            NativeWaiter::Token => self.resume_token(target, data),
        }
    }

    fn resume_token(&mut self, target: &str, data: Option<TargetData>) -> Vec<ProxyAction> {
        match self.pending_token.take() {
            Some(PendingToken::Targets) if target == TARGETS => self.continue_token_with_targets(),
            Some(PendingToken::Contents(wanted)) if wanted == target => {
                let contents = data.filter(|d| !d.value.is_empty()).map(|d| (wanted, d));
                self.finish_token(contents)
            }
            other => {
                self.pending_token = other;
                Vec::new()
            }
        }
    }

    /// Register a waiter; returns true if it is the first for this key
    fn add_native_waiter(&mut self, key: &str, waiter: NativeWaiter) -> bool {
        let waiters = self.native_reads.entry(key.to_string()).or_default();
        let first = waiters.is_empty();
        if !(waiter == NativeWaiter::Token && waiters.contains(&NativeWaiter::Token)) {
            waiters.push(waiter);
        }
        first
    }

    fn query_targets(&mut self, waiter: NativeWaiter) {
        self.add_native_waiter(TARGETS, waiter);
        if self.targets_query.is_some() {
            debug!("{}: joining TARGETS query in flight", self.selection);
            return;
        }
        self.start_targets_query();
    }

    fn start_targets_query(&mut self) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let query_id = self.next_query_id;
        self.next_query_id += 1;
        self.targets_query = Some(TargetsQuery {
            id: query_id,
            generation: self.owner_generation,
        });
        let events = self.events.clone();
        let selection = self.selection.clone();
        let limit = self.config.native_timeout;
        tokio::spawn(async move {
            let result = with_timeout(limit, backend.current_targets()).await;
            let _ = events.send(EngineEvent::TargetsQueried {
                selection,
                query_id,
                result,
            });
        });
    }

    fn read_native(&mut self, target: &str, waiter: NativeWaiter) {
        if let Some(read) = self.incremental.as_mut().filter(|r| r.transfer.target() == target) {
            debug!("{}: joining incremental read of {}", self.selection, target);
            if !(waiter == NativeWaiter::Token && read.waiters.contains(&NativeWaiter::Token)) {
                read.waiters.push(waiter);
            }
            return;
        }
        if !self.add_native_waiter(target, waiter) {
            debug!("{}: joining native read of {} in flight", self.selection, target);
            return;
        }
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let events = self.events.clone();
        let selection = self.selection.clone();
        let target = target.to_string();
        let limit = self.config.native_timeout;
        tokio::spawn(async move {
            let result = with_timeout(limit, backend.read(&target)).await;
            let _ = events.send(EngineEvent::ContentsRead {
                selection,
                target,
                result,
            });
        });
    }

    fn write_native(&self, target: String, data: TargetData) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        self.spawn_backend_call("write", async move { backend.write(&target, data).await });
    }

    fn spawn_backend_call<F>(&self, operation: &'static str, call: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let events = self.events.clone();
        let selection = self.selection.clone();
        let limit = self.config.native_timeout;
        tokio::spawn(async move {
            let result = with_timeout(limit, call).await;
            let _ = events.send(EngineEvent::BackendDone {
                selection,
                operation,
                result,
            });
        });
    }

    /// Native target query finished.
    ///
    /// A list read before the latest owner change belongs to the previous
    /// owner: it is thrown away and the query runs again.
    pub fn on_targets_queried(&mut self, query_id: u64, result: Result<Vec<String>>) -> Vec<ProxyAction> {
        let generation = match self.targets_query {
            Some(query) if query.id == query_id => query.generation,
            _ => {
                debug!("{}: dropping stale TARGETS query {}", self.selection, query_id);
                return Vec::new();
            }
        };
        self.targets_query = None;
        if generation != self.owner_generation {
            debug!("{}: owner changed during TARGETS query, querying again", self.selection);
            self.start_targets_query();
            return Vec::new();
        }
        let waiters = self.native_reads.remove(TARGETS).unwrap_or_default();
        let data = match result {
            Ok(targets) => {
                debug!("{}: native targets {:?}", self.selection, targets);
                self.targets = targets;
                Some(TargetData::targets(self.targets.clone()))
            }
            Err(e) => {
                error!("{}: failed to query targets: {}", self.selection, e);
                None
            }
        };
        let mut actions = Vec::new();
        for waiter in waiters {
            actions.extend(self.deliver(waiter, TARGETS, data.clone()));
        }
        actions
    }

    /// Native read finished
    pub fn on_contents_read(&mut self, target: &str, result: Result<ReadOutcome>) -> Vec<ProxyAction> {
        let waiters = self.native_reads.remove(target).unwrap_or_default();
        let data = match result {
            Ok(ReadOutcome::Ready(data)) => Some(data),
            Ok(ReadOutcome::Empty) => None,
            Ok(ReadOutcome::Incremental {
                transfer_id,
                format,
                total_size,
            }) => {
                if waiters.is_empty() {
                    debug!("{}: nobody waits for incremental read of {} anymore", self.selection, target);
                    return Vec::new();
                }
                return self.start_incremental(target, transfer_id, format, total_size, waiters);
            }
            Err(e) => {
                error!("{}: failed to read {}: {}", self.selection, target, e);
                None
            }
        };
        let mut actions = Vec::new();
        for waiter in waiters {
            actions.extend(self.deliver(waiter, target, data.clone()));
        }
        actions
    }

    // ------------------------------------------------------------------
    // Incremental native reads
    // ------------------------------------------------------------------

    fn start_incremental(
        &mut self,
        target: &str,
        transfer_id: u64,
        format: BitFormat,
        total_size: usize,
        waiters: Vec<NativeWaiter>,
    ) -> Vec<ProxyAction> {
        let mut actions = Vec::new();
        if let Some(mut previous) = self.incremental.take() {
            warn!(
                "{}: incremental read of {} replaced by {}",
                self.selection,
                previous.transfer.target(),
                target
            );
            previous.transfer.cancel();
            let previous_target = previous.transfer.target().to_string();
            for waiter in previous.waiters {
                actions.extend(self.deliver(waiter, &previous_target, None));
            }
        }

        let transfer = match IncrementalTransfer::start(target, total_size, self.config.max_incremental_size) {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!("{}: refusing incremental read of {}: {}", self.selection, target, e);
                for waiter in waiters {
                    actions.extend(self.deliver(waiter, target, None));
                }
                return actions;
            }
        };
        let timer = self.incremental_timer();
        self.incremental = Some(IncrementalRead {
            transfer_id,
            transfer,
            format,
            waiters,
            timer,
        });
        actions
    }

    fn incremental_timer(&mut self) -> ScheduledTask {
        let id = self.timer_ids.next_id();
        ScheduledTask::schedule(
            id,
            self.config.incremental_timeout,
            self.events.clone(),
            EngineEvent::Timer(TimerEvent::IncrementalTimeout {
                selection: self.selection.clone(),
                id,
            }),
        )
    }

    /// Next chunk of incremental read `transfer_id`
    pub fn on_chunk(&mut self, transfer_id: u64, type_tag: &str, chunk: &[u8]) -> Vec<ProxyAction> {
        let Some(read) = self.incremental.as_mut().filter(|r| r.transfer_id == transfer_id) else {
            debug!(
                "{}: dropping {} bytes of inactive transfer {}",
                self.selection,
                chunk.len(),
                transfer_id
            );
            return Vec::new();
        };
        match read.transfer.push_chunk(type_tag, chunk) {
            Ok(ChunkOutcome::NeedMore) => {
                let timer = self.incremental_timer();
                if let Some(read) = self.incremental.as_mut() {
                    // replacing the task cancels the previous timer
                    read.timer = timer;
                }
                Vec::new()
            }
            Ok(ChunkOutcome::Complete { type_tag, data }) => {
                let Some(read) = self.incremental.take() else {
                    return Vec::new();
                };
                let target = read.transfer.target().to_string();
                let datum = TargetData {
                    type_tag,
                    format: read.format,
                    value: SelectionValue::Bytes(data),
                };
                let mut actions = Vec::new();
                for waiter in read.waiters {
                    actions.extend(self.deliver(waiter, &target, Some(datum.clone())));
                }
                actions
            }
            Err(e) => {
                warn!("{}: incremental read aborted: {}", self.selection, e);
                self.abort_incremental()
            }
        }
    }

    /// The incremental read stalled
    pub fn on_incremental_timeout(&mut self, id: u64) -> Vec<ProxyAction> {
        match &self.incremental {
            Some(read) if read.timer.id() == id => {
                let progress = read.transfer.progress();
                warn!(
                    "{}: incremental read of {} timed out after {} of {} bytes",
                    self.selection,
                    read.transfer.target(),
                    progress.transferred_bytes,
                    progress.total_bytes
                );
                self.abort_incremental()
            }
            _ => Vec::new(),
        }
    }

    fn abort_incremental(&mut self) -> Vec<ProxyAction> {
        let Some(mut read) = self.incremental.take() else {
            return Vec::new();
        };
        read.transfer.cancel();
        let target = read.transfer.target().to_string();
        let mut actions = Vec::new();
        for waiter in read.waiters {
            actions.extend(self.deliver(waiter, &target, None));
        }
        actions
    }

    // ------------------------------------------------------------------
    // Native client asks for peer contents
    // ------------------------------------------------------------------

    /// A native client wants `target` while we hold the token
    pub fn handle_local_request(
        &mut self,
        target: &str,
        reply: oneshot::Sender<Option<TargetData>>,
    ) -> Vec<ProxyAction> {
        self.counters.local_requests += 1;
        if !self.enabled || !self.have_token || !self.can_receive {
            debug!(
                "{}: local request for {} refused (enabled={}, have_token={}, can_receive={})",
                self.selection, target, self.enabled, self.have_token, self.can_receive
            );
            let _ = reply.send(None);
            return Vec::new();
        }
        if self.config.filter.must_discard(target) {
            info!("{}: rejecting local request for invalid target {}", self.selection, target);
            let _ = reply.send(None);
            return Vec::new();
        }
        if target == TARGETS {
            if !self.targets.is_empty() {
                let _ = reply.send(Some(TargetData::targets(self.targets.clone())));
                return Vec::new();
            }
            return self.wait_for_peer(TARGETS, target, reply);
        }

        let mut wanted = target.to_string();
        if !self.targets.is_empty() && !self.targets.iter().any(|t| t == target) {
            let translated = self
                .config
                .translated_targets
                .get(target)
                .and_then(|candidates| candidates.iter().find(|c| self.targets.contains(c)))
                .cloned();
            match translated {
                Some(t) => {
                    debug!("{}: serving unknown target {} as {}", self.selection, target, t);
                    wanted = t;
                }
                None if self.config.filter.must_discard_extra(target) => {
                    debug!("{}: dropping request for unadvertised {}", self.selection, target);
                    let _ = reply.send(None);
                    return Vec::new();
                }
                None => {}
            }
        }

        if let Some(data) = self.target_data.get(&wanted) {
            let _ = reply.send(Some(rename_type(data.clone(), &wanted, target)));
            return Vec::new();
        }
        self.wait_for_peer(&wanted, target, reply)
    }

    fn wait_for_peer(
        &mut self,
        wanted: &str,
        requested: &str,
        reply: oneshot::Sender<Option<TargetData>>,
    ) -> Vec<ProxyAction> {
        let waiters = self.local_waiters.entry(wanted.to_string()).or_default();
        let first = waiters.is_empty();
        waiters.push(LocalWaiter {
            requested: requested.to_string(),
            reply,
        });
        if first {
            vec![ProxyAction::RequestRemote {
                target: wanted.to_string(),
            }]
        } else {
            debug!("{}: already waiting on the peer for {}", self.selection, wanted);
            Vec::new()
        }
    }

    /// The peer answered (or failed to answer) a request for `target`
    pub fn remote_contents(&mut self, target: &str, data: Option<TargetData>) {
        if target == TARGETS {
            if let Some(TargetData {
                value: SelectionValue::Targets(targets),
                ..
            }) = &data
            {
                self.targets = self.config.filter.filter(targets);
            }
        }
        self.answer_local(target, data);
    }

    fn answer_local(&mut self, target: &str, data: Option<TargetData>) {
        let Some(waiters) = self.local_waiters.remove(target) else {
            return;
        };
        debug!("{}: answering {} local request(s) for {}", self.selection, waiters.len(), target);
        for waiter in waiters {
            let data = data.clone().map(|d| rename_type(d, target, &waiter.requested));
            if waiter.reply.send(data).is_err() {
                debug!("{}: local requester for {} went away", self.selection, target);
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Forget everything learned from the peer
    pub fn reset(&mut self) -> Vec<ProxyAction> {
        self.greedy_client = false;
        self.want_targets = false;
        self.preferred_targets.clear();
        self.have_token = false;
        self.targets.clear();
        self.target_data.clear();
        self.enabled = self.backend.is_some();
        self.release_waiters()
    }

    /// Cancel timers and answer every waiter with no data
    pub fn cleanup(&mut self) -> Vec<ProxyAction> {
        self.enabled = false;
        self.release_waiters()
    }

    fn release_waiters(&mut self) -> Vec<ProxyAction> {
        self.cancel_emit_token();
        self.pending_token = None;
        self.targets_query = None;
        let mut actions = self.abort_incremental();
        let reads: Vec<(String, Vec<NativeWaiter>)> = self.native_reads.drain().collect();
        for (target, waiters) in reads {
            for waiter in waiters {
                if let NativeWaiter::Remote(request_id) = waiter {
                    actions.push(ProxyAction::Reply {
                        request_id,
                        target: target.clone(),
                        data: None,
                    });
                }
            }
        }
        for (_, waiters) in self.local_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.reply.send(None);
            }
        }
        actions
    }

    /// Detach the backend
    pub async fn detach(&self) {
        if let Some(backend) = &self.backend {
            backend.detach().await;
        }
    }

    /// Snapshot
    pub fn info(&self) -> ProxyInfo {
        ProxyInfo {
            selection: self.selection.clone(),
            has_backend: self.backend.is_some(),
            enabled: self.enabled,
            have_token: self.have_token,
            can_send: self.can_send,
            can_receive: self.can_receive,
            greedy_client: self.greedy_client,
            want_targets: self.want_targets,
            owner_change_embargo: self.embargoed(),
            emit_scheduled: self.emit_timer.as_ref().is_some_and(ScheduledTask::is_pending),
            targets: self.targets.clone(),
            pending_local: self.local_waiters.values().map(Vec::len).sum(),
            pending_native: self.native_reads.values().map(Vec::len).sum(),
            incremental_progress: self.incremental.as_ref().map(|r| r.transfer.progress().percentage()),
            counters: self.counters.clone(),
        }
    }
}

/// Pick the targets worth inlining for a greedy peer, best first.
///
/// With peer preferences: images both sides know, then common text targets,
/// then any common target. Without: text targets, then everything.
pub fn choose_targets(targets: &[String], preferred: &[String]) -> Vec<String> {
    if !preferred.is_empty() {
        let images: Vec<String> = IMAGE_TARGETS
            .iter()
            .filter(|fmt| targets.iter().any(|t| t == *fmt) && preferred.iter().any(|p| p == *fmt))
            .map(|fmt| fmt.to_string())
            .collect();
        if !images.is_empty() {
            return images;
        }
        let common: Vec<String> = preferred.iter().filter(|p| targets.contains(p)).cloned().collect();
        let text: Vec<String> = common.iter().filter(|t| is_text_target(t)).cloned().collect();
        if !text.is_empty() {
            return text;
        }
        return common;
    }
    let text: Vec<String> = targets.iter().filter(|t| is_text_target(t)).cloned().collect();
    if !text.is_empty() {
        return text;
    }
    targets.to_vec()
}

/// A value fetched for a translated target keeps the requested name as type
fn rename_type(mut data: TargetData, fetched: &str, requested: &str) -> TargetData {
    if fetched != requested && data.type_tag == fetched {
        data.type_tag = requested.to_string();
    }
    data
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::BackendTimeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::backend::BackendContext;
    use crate::clipboard::event::EventReceiver;
    use crate::clipboard::memory::InMemoryBackend;
    use tokio::sync::mpsc;

    fn proxy_with_backend() -> (SelectionProxy, Arc<InMemoryBackend>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(InMemoryBackend::new("CLIPBOARD"));
        let proxy = SelectionProxy::new("CLIPBOARD", Some(backend.clone()), tx, ProxyConfig::default());
        (proxy, backend, rx)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_without_backend_is_inert() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut proxy = SelectionProxy::new("PRIMARY", None, tx, ProxyConfig::default());
        assert!(!proxy.is_enabled());
        proxy.set_enabled(true);
        assert!(!proxy.is_enabled());
        assert!(proxy.owner_changed().is_empty());

        let (reply, rx) = oneshot::channel();
        assert!(proxy.handle_local_request("UTF8_STRING", reply).is_empty());
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_change_without_token_is_silent() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        assert!(proxy.owner_changed().is_empty());
        assert_eq!(proxy.info().counters.owner_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_change_with_token_emits_immediately() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(Some(strings(&["UTF8_STRING"])), HashMap::new(), true, false);
        assert!(proxy.have_token());
        // the claim arms the embargo
        tokio::time::sleep(DEFAULT_OWNER_CHANGE_EMBARGO * 2).await;

        let actions = proxy.owner_changed();
        assert_eq!(
            actions,
            vec![ProxyAction::SendToken {
                targets: None,
                contents: None,
                claim: true
            }]
        );
        assert!(!proxy.have_token());
        // owner change clears what the peer told us
        assert!(proxy.targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_embargo_suppresses_echo() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(Some(strings(&["TEXT"])), HashMap::new(), true, false);
        assert!(proxy.owner_changed().is_empty());
        assert!(proxy.have_token());
        assert_eq!(proxy.info().counters.owner_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_replaces_pending_emission() {
        let (mut proxy, _backend, mut rx) = proxy_with_backend();
        proxy.set_want_targets(true);
        proxy.set_direction(true, true);

        // first emission is immediate and needs the targets
        assert!(proxy.schedule_emit_token().is_empty());
        assert!(matches!(rx.recv().await, Some(EngineEvent::TargetsQueried { .. })));

        // a second one right after is delayed, a third replaces it
        assert!(proxy.schedule_emit_token().is_empty());
        let first_id = proxy.emit_timer.as_ref().map(ScheduledTask::id).unwrap();
        assert!(proxy.schedule_emit_token().is_empty());
        let second_id = proxy.emit_timer.as_ref().map(ScheduledTask::id).unwrap();
        assert_ne!(first_id, second_id);
        assert!(proxy.on_emit_timer(first_id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_got_token_without_claim_updates_caches() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        let mut data = HashMap::new();
        data.insert("UTF8_STRING".to_string(), TargetData::text("hi"));
        proxy.got_token(Some(strings(&["TEXT"])), data, false, false);
        assert!(!proxy.have_token());
        assert_eq!(proxy.targets(), &strings(&["TEXT", "UTF8_STRING"])[..]);
        assert_eq!(proxy.cached_data("UTF8_STRING"), Some(&TargetData::text("hi")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_got_token_ignored_when_disabled() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.set_enabled(false);
        proxy.got_token(Some(strings(&["TEXT"])), HashMap::new(), true, false);
        assert!(!proxy.have_token());
        assert!(proxy.targets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_got_token_answers_waiting_targets_requests() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(None, HashMap::new(), true, false);

        let (reply, rx) = oneshot::channel();
        let actions = proxy.handle_local_request(TARGETS, reply);
        assert_eq!(
            actions,
            vec![ProxyAction::RequestRemote {
                target: TARGETS.to_string()
            }]
        );

        proxy.got_token(Some(strings(&["UTF8_STRING"])), HashMap::new(), true, false);
        let answer = rx.await.unwrap().unwrap();
        assert_eq!(answer.value, SelectionValue::Targets(strings(&["UTF8_STRING"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_requests_are_coalesced() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(Some(strings(&["UTF8_STRING"])), HashMap::new(), true, false);

        let (a, rx_a) = oneshot::channel();
        let (b, rx_b) = oneshot::channel();
        assert_eq!(proxy.handle_local_request("UTF8_STRING", a).len(), 1);
        assert!(proxy.handle_local_request("UTF8_STRING", b).is_empty());

        proxy.remote_contents("UTF8_STRING", Some(TargetData::text("shared")));
        assert_eq!(rx_a.await.unwrap(), Some(TargetData::text("shared")));
        assert_eq!(rx_b.await.unwrap(), Some(TargetData::text("shared")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_request_translation_and_extra_targets() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        let mut data = HashMap::new();
        data.insert("UTF8_STRING".to_string(), TargetData::text("<b>x</b>"));
        proxy.got_token(Some(strings(&["UTF8_STRING"])), data, true, false);

        let (reply, rx) = oneshot::channel();
        assert!(proxy.handle_local_request("application/x-moz-nativehtml", reply).is_empty());
        let answer = rx.await.unwrap().unwrap();
        assert_eq!(answer.type_tag, "application/x-moz-nativehtml");
        assert_eq!(answer.as_bytes().unwrap(), b"<b>x</b>");

        let (reply, rx) = oneshot::channel();
        assert!(proxy.handle_local_request("SAVE_TARGETS", reply).is_empty());
        assert_eq!(rx.await.unwrap(), None);

        let (reply, rx) = oneshot::channel();
        assert!(proxy.handle_local_request("com.apple.webarchive", reply).is_empty());
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_requests_share_one_native_read() {
        let (mut proxy, backend, mut rx) = proxy_with_backend();
        backend.set_contents(vec![("UTF8_STRING".to_string(), TargetData::text("local"))]);

        assert!(proxy.handle_remote_request(1, "UTF8_STRING").is_empty());
        assert!(proxy.handle_remote_request(2, "UTF8_STRING").is_empty());

        let Some(EngineEvent::ContentsRead { target, result, .. }) = rx.recv().await else {
            panic!("expected a read completion");
        };
        let actions = proxy.on_contents_read(&target, result);
        assert_eq!(actions.len(), 2);
        for action in actions {
            match action {
                ProxyAction::Reply { data, .. } => assert_eq!(data, Some(TargetData::text("local"))),
                other => panic!("unexpected {:?}", other),
            }
        }
        // only one read was issued
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_request_while_holding_token_answers_from_cache_only() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(Some(strings(&["TEXT"])), HashMap::new(), true, false);
        let actions = proxy.handle_remote_request(4, "TEXT");
        assert_eq!(
            actions,
            vec![ProxyAction::Reply {
                request_id: 4,
                target: "TEXT".to_string(),
                data: None
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_greedy_emission_inlines_text() {
        let (mut proxy, backend, mut rx) = proxy_with_backend();
        proxy.set_greedy_client(true);
        backend.set_contents(vec![
            ("image/png".to_string(), TargetData::bytes("image/png", vec![1, 2, 3])),
            ("UTF8_STRING".to_string(), TargetData::text("greedy")),
        ]);

        assert!(proxy.emit_token().is_empty());
        let Some(EngineEvent::TargetsQueried { query_id, result, .. }) = rx.recv().await else {
            panic!("expected targets");
        };
        assert!(proxy.on_targets_queried(query_id, result).is_empty());

        let Some(EngineEvent::ContentsRead { target, result, .. }) = rx.recv().await else {
            panic!("expected contents");
        };
        assert_eq!(target, "UTF8_STRING");
        let actions = proxy.on_contents_read(&target, result);
        match &actions[..] {
            [ProxyAction::SendToken {
                targets: Some(targets),
                contents: Some((target, data)),
                ..
            }] => {
                assert!(targets.contains(&"image/png".to_string()));
                assert_eq!(target, "UTF8_STRING");
                assert_eq!(data, &TargetData::text("greedy"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_read_reassembles() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.native_reads.insert("image/png".to_string(), vec![NativeWaiter::Remote(9)]);
        let actions = proxy.on_contents_read(
            "image/png",
            Ok(ReadOutcome::Incremental {
                transfer_id: 1,
                format: BitFormat::Eight,
                total_size: 6,
            }),
        );
        assert!(actions.is_empty());
        assert!(proxy.on_chunk(1, "image/png", b"abc").is_empty());
        assert!(proxy.on_chunk(1, "image/png", b"def").is_empty());
        let actions = proxy.on_chunk(1, "image/png", b"");
        match &actions[..] {
            [ProxyAction::Reply {
                request_id: 9,
                data: Some(data),
                ..
            }] => assert_eq!(data.as_bytes().unwrap(), b"abcdef"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_timeout_answers_no_data() {
        let (mut proxy, _backend, mut rx) = proxy_with_backend();
        proxy.native_reads.insert("STRING".to_string(), vec![NativeWaiter::Remote(3)]);
        proxy.on_contents_read(
            "STRING",
            Ok(ReadOutcome::Incremental {
                transfer_id: 1,
                format: BitFormat::Eight,
                total_size: 10,
            }),
        );
        proxy.on_chunk(1, "STRING", b"12345");

        let Some(EngineEvent::Timer(TimerEvent::IncrementalTimeout { id, .. })) = rx.recv().await else {
            panic!("expected a timeout");
        };
        let actions = proxy.on_incremental_timeout(id);
        assert_eq!(
            actions,
            vec![ProxyAction::Reply {
                request_id: 3,
                target: "STRING".to_string(),
                data: None
            }]
        );
        assert!(proxy.info().incremental_progress.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_requests_share_incremental_read() {
        let (mut proxy, backend, mut rx) = proxy_with_backend();
        backend.set_contents(vec![("STRING".to_string(), TargetData::bytes("STRING", b"0123456789".to_vec()))]);
        backend.set_incremental_chunk_size(Some(4));
        backend
            .attach(BackendContext::new("CLIPBOARD", proxy.events.clone()))
            .await
            .unwrap();

        assert!(proxy.handle_remote_request(1, "STRING").is_empty());
        let mut replies = Vec::new();
        let mut second_sent = false;
        while replies.len() < 2 {
            let event = rx.recv().await.unwrap();
            let actions = match event {
                EngineEvent::ContentsRead { target, result, .. } => proxy.on_contents_read(&target, result),
                EngineEvent::IncrementalChunk {
                    transfer_id,
                    type_tag,
                    data,
                    ..
                } => {
                    let actions = proxy.on_chunk(transfer_id, &type_tag, &data);
                    if !second_sent {
                        // the second request arrives mid-transfer
                        second_sent = true;
                        assert!(proxy.handle_remote_request(2, "STRING").is_empty());
                    }
                    actions
                }
                other => panic!("unexpected {:?}", other),
            };
            replies.extend(actions);
        }

        assert_eq!(backend.read_count(), 1);
        let mut ids = Vec::new();
        for reply in replies {
            match reply {
                ProxyAction::Reply {
                    request_id,
                    data: Some(data),
                    ..
                } => {
                    assert_eq!(data.as_bytes().unwrap(), b"0123456789");
                    ids.push(request_id);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_of_replaced_transfer_are_dropped() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.native_reads.insert("STRING".to_string(), vec![NativeWaiter::Remote(1)]);
        proxy.on_contents_read(
            "STRING",
            Ok(ReadOutcome::Incremental {
                transfer_id: 1,
                format: BitFormat::Eight,
                total_size: 4,
            }),
        );
        proxy.native_reads.insert("image/png".to_string(), vec![NativeWaiter::Remote(2)]);
        let actions = proxy.on_contents_read(
            "image/png",
            Ok(ReadOutcome::Incremental {
                transfer_id: 2,
                format: BitFormat::Eight,
                total_size: 3,
            }),
        );
        assert_eq!(
            actions,
            vec![ProxyAction::Reply {
                request_id: 1,
                target: "STRING".to_string(),
                data: None
            }]
        );

        // leftovers of the first stream do not reach the second transfer
        assert!(proxy.on_chunk(1, "STRING", b"abcd").is_empty());
        assert!(proxy.on_chunk(2, "image/png", b"png").is_empty());
        match &proxy.on_chunk(2, "image/png", b"")[..] {
            [ProxyAction::Reply {
                request_id: 2,
                data: Some(data),
                ..
            }] => assert_eq!(data.as_bytes().unwrap(), b"png"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_outcome_without_waiters_is_ignored() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        let actions = proxy.on_contents_read(
            "STRING",
            Ok(ReadOutcome::Incremental {
                transfer_id: 5,
                format: BitFormat::Eight,
                total_size: 4,
            }),
        );
        assert!(actions.is_empty());
        assert!(proxy.info().incremental_progress.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_change_during_targets_query_requeries() {
        let (mut proxy, backend, mut rx) = proxy_with_backend();
        proxy.set_want_targets(true);
        backend.set_contents(vec![("STRING".to_string(), TargetData::bytes("STRING", b"old".to_vec()))]);

        assert!(proxy.emit_token().is_empty());
        let Some(EngineEvent::TargetsQueried { query_id: stale, .. }) = rx.recv().await else {
            panic!("expected targets");
        };

        // a new owner shows up before the stale answer is handled
        tokio::time::sleep(DEFAULT_OWNER_CHANGE_EMBARGO * 2).await;
        backend.set_contents(vec![("UTF8_STRING".to_string(), TargetData::text("new"))]);
        assert!(proxy.owner_changed().is_empty());

        assert!(proxy.on_targets_queried(stale, Ok(strings(&["STRING"]))).is_empty());
        assert!(proxy.targets().is_empty());

        let Some(EngineEvent::TargetsQueried { query_id, result, .. }) = rx.recv().await else {
            panic!("expected a second query");
        };
        assert_ne!(query_id, stale);
        match &proxy.on_targets_queried(query_id, result)[..] {
            [ProxyAction::SendToken {
                targets: Some(targets), ..
            }] => assert_eq!(targets, &strings(&["UTF8_STRING"])),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_releases_everyone() {
        let (mut proxy, _backend, _rx) = proxy_with_backend();
        proxy.got_token(Some(strings(&["TEXT"])), HashMap::new(), true, false);
        let (reply, rx) = oneshot::channel();
        proxy.handle_local_request("TEXT", reply);
        proxy.native_reads.insert("STRING".to_string(), vec![NativeWaiter::Remote(8)]);

        let actions = proxy.cleanup();
        assert_eq!(
            actions,
            vec![ProxyAction::Reply {
                request_id: 8,
                target: "STRING".to_string(),
                data: None
            }]
        );
        assert_eq!(rx.await.unwrap(), None);
        assert!(!proxy.is_enabled());
    }

    #[test]
    fn test_choose_targets() {
        let targets = strings(&["image/png", "UTF8_STRING", "text/html", "application/x-foo"]);
        assert_eq!(choose_targets(&targets, &[]), strings(&["UTF8_STRING", "text/html"]));
        assert_eq!(
            choose_targets(&targets, &strings(&["image/png", "text/html"])),
            strings(&["image/png"])
        );
        assert_eq!(
            choose_targets(&targets, &strings(&["text/html", "application/x-foo"])),
            strings(&["text/html"])
        );
        assert_eq!(
            choose_targets(&targets, &strings(&["application/x-foo"])),
            strings(&["application/x-foo"])
        );
        assert_eq!(
            choose_targets(&strings(&["application/x-foo"]), &[]),
            strings(&["application/x-foo"])
        );
    }
}
