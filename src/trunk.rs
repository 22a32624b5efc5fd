//! The connection pool and request multiplexer.
//!
//! A priority-ordered backlog, per-connection pending/partial/sent queues,
//! and the readiness-driven dispatch/read loops that move a request from
//! backlog to wire and a reply back to its caller.

use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::codec::{self, Codec};
use crate::config::Config;
use crate::connection::{check_for_zombie, ConnState, Connection};
use crate::error::ResultCode;
use crate::ids::{ConnectionId, TrunkEntryId};
use crate::metrics::TrunkMetrics;
use crate::request::{priority_key, EntryState, PriorityKey, ProtocolRequest};
use crate::retry::{RetryOutcome, RetryState};
use crate::transport::Transport;

/// Outcome of [`Trunk::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Ok,
    InBacklog,
    NoCapacity,
    DstUnavailable,
    Fail,
}

/// One live request tracked by the trunk (everything except status-check
/// probes, which live entirely on their owning [`Connection`] and are never
/// given an entry here).
struct TrunkEntry {
    request: ProtocolRequest,
    state: EntryState,
    conn: Option<ConnectionId>,
    resume: Option<oneshot::Sender<ResultCode>>,
}

/// Commands the Dispatcher sends into a running trunk.
pub enum Command {
    Submit {
        request: ProtocolRequest,
        resume: oneshot::Sender<ResultCode>,
        reply: oneshot::Sender<(EnqueueOutcome, TrunkEntryId)>,
    },
    Cancel(TrunkEntryId),
    /// Upstream duplicate observed for this entry; PROXY mode only.
    Dup(TrunkEntryId),
    /// Introspection snapshot request.
    Snapshot(oneshot::Sender<TrunkSnapshot>),
}

enum IoEvent {
    Readable(usize),
    Writable(usize),
}

/// Pool of [`Connection`]s sharing one request queue, bound to one worker.
pub struct Trunk<T: Transport> {
    config: Arc<Config>,
    codec: Arc<dyn Codec>,
    connections: Vec<Connection<T>>,
    entries: Vec<Option<TrunkEntry>>,
    free_entries: Vec<u32>,
    backlog: BinaryHeap<(PriorityKey, TrunkEntryId)>,
    pending: Vec<BinaryHeap<(PriorityKey, TrunkEntryId)>>,
    partial: Vec<Option<TrunkEntryId>>,
    sent: Vec<HashSet<TrunkEntryId>>,
    next_round_robin: usize,
    metrics: TrunkMetrics,
}

impl<T: Transport> Trunk<T> {
    pub fn new(config: Config, codec: Arc<dyn Codec>, transports: Vec<T>) -> Self {
        let config = Arc::new(config);
        let n = transports.len();
        let connections = transports
            .into_iter()
            .map(|t| Connection::new(t, &config))
            .collect();
        Self {
            config,
            codec,
            connections,
            entries: Vec::new(),
            free_entries: Vec::new(),
            backlog: BinaryHeap::new(),
            pending: (0..n).map(|_| BinaryHeap::new()).collect(),
            partial: vec![None; n],
            sent: (0..n).map(|_| HashSet::new()).collect(),
            next_round_robin: 0,
            metrics: TrunkMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &TrunkMetrics {
        &self.metrics
    }

    /// Introspection snapshot.
    pub fn snapshot(&self) -> TrunkSnapshot {
        TrunkSnapshot {
            connections: self.connections.iter().map(|c| c.snapshot()).collect(),
            backlog_len: self.backlog.len(),
            outstanding: self.outstanding(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn outstanding(&self) -> usize {
        self.entries.len() - self.free_entries.len()
    }

    fn destination_unavailable(&self) -> bool {
        self.connections
            .iter()
            .all(|c| matches!(c.state, ConnState::DeadRevive | ConnState::Closed))
    }

    /// Accepts a new request. Always stores the entry in
    /// the backlog first, then attempts an immediate assignment so callers
    /// can tell `OK` (assigned right away) from `IN_BACKLOG` apart.
    pub fn enqueue(
        &mut self,
        request: ProtocolRequest,
        resume: oneshot::Sender<ResultCode>,
    ) -> (EnqueueOutcome, TrunkEntryId) {
        if self.outstanding() >= self.config.max_backlog {
            return (EnqueueOutcome::NoCapacity, TrunkEntryId::NONE);
        }
        if self.destination_unavailable() {
            return (EnqueueOutcome::DstUnavailable, TrunkEntryId::NONE);
        }
        let key = priority_key(request.is_status_check, request.priority, request.recv_time);
        let entry = TrunkEntry {
            request,
            state: EntryState::Backlog,
            conn: None,
            resume: Some(resume),
        };
        let id = self.alloc_entry(entry);
        self.backlog.push((key, id));
        self.assign_backlog();
        let outcome = match self.entries[id.index()].as_ref().map(|e| e.state) {
            Some(EntryState::Backlog) => EnqueueOutcome::InBacklog,
            Some(_) => EnqueueOutcome::Ok,
            None => EnqueueOutcome::Ok,
        };
        (outcome, id)
    }

    fn alloc_entry(&mut self, entry: TrunkEntry) -> TrunkEntryId {
        if let Some(idx) = self.free_entries.pop() {
            self.entries[idx as usize] = Some(entry);
            TrunkEntryId::new(idx)
        } else {
            self.entries.push(Some(entry));
            TrunkEntryId::new((self.entries.len() - 1) as u32)
        }
    }

    fn free_entry(&mut self, id: TrunkEntryId) {
        self.entries[id.index()] = None;
        self.free_entries.push(id.index() as u32);
    }

    /// Moves as many backlog entries as possible onto connections that can
    /// accept writes (round-robin across ACTIVE connections).
    fn assign_backlog(&mut self) {
        if self.connections.is_empty() {
            return;
        }
        while let Some(&(key, id)) = self.backlog.peek() {
            let Some(conn_idx) = self.pick_connection() else {
                break;
            };
            self.backlog.pop();
            if let Some(entry) = &mut self.entries[id.index()] {
                entry.state = EntryState::Pending;
                entry.conn = Some(ConnectionId::new(conn_idx as u32));
            }
            self.pending[conn_idx].push((key, id));
        }
    }

    fn pick_connection(&mut self) -> Option<usize> {
        let n = self.connections.len();
        for offset in 0..n {
            let idx = (self.next_round_robin + offset) % n;
            if matches!(self.connections[idx].state, ConnState::Active) {
                self.next_round_robin = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Removes a cancelled entry's resources (the CANCEL signal). A stream
    /// transport cancelled mid-write is left with a corrupted byte stream —
    /// unlike a datagram, where the partial write can simply be skipped — so
    /// the connection is forced to reconnect.
    pub async fn cancel(&mut self, id: TrunkEntryId) {
        let Some(entry) = self.entries[id.index()].take() else {
            return;
        };
        let mut force_reconnect = None;
        if let Some(conn) = entry.conn {
            if let Some(assigned) = entry.request.assigned_id {
                self.connections[conn.index()].id_tracker.release(assigned);
            }
            self.sent[conn.index()].remove(&id);
            if self.partial[conn.index()] == Some(id) {
                self.partial[conn.index()] = None;
                if self.connections[conn.index()].transport.is_stream() {
                    force_reconnect = Some(conn.index());
                }
            }
        }
        self.free_entries.push(id.index() as u32);
        if let Some(resume) = entry.resume {
            let _ = resume.send(ResultCode::Fail);
        }
        self.metrics.cancelled.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Some(idx) = force_reconnect {
            self.fail_connection(idx).await;
        }
    }

    /// DUP signal: in PROXY mode, re-transmit on the same connection unless
    /// write-blocked.
    pub async fn on_dup(&mut self, id: TrunkEntryId, now: Instant) {
        if self.config.mode != crate::config::Mode::Proxy {
            return;
        }
        let Some(conn_idx) = self.entries[id.index()].as_ref().and_then(|e| e.conn) else {
            return;
        };
        let conn_idx = conn_idx.index();
        if self.connections[conn_idx].write_blocked {
            return;
        }
        let is_proxy = self.config.mode == crate::config::Mode::Proxy;
        let last_sent = self.connections[conn_idx].timestamps.last_sent;
        let config = Arc::clone(&self.config);
        check_for_zombie(&mut self.connections[conn_idx], now, last_sent, is_proxy, &config);
        self.retransmit_sent_entry(conn_idx, id).await;
    }

    async fn retransmit_sent_entry(&mut self, conn_idx: usize, id: TrunkEntryId) {
        if !self.sent[conn_idx].contains(&id) {
            return;
        }
        let Some(bytes) = self.entries[id.index()]
            .as_ref()
            .and_then(|e| e.request.encoded.clone())
        else {
            return;
        };
        match self.connections[conn_idx].transport.try_send(&bytes) {
            Ok(_) => {
                self.connections[conn_idx].record_sent(Instant::now());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.connections[conn_idx].write_blocked = true;
            }
            Err(e) => {
                warn!(error = %e, "dup retransmit failed");
                self.fail_connection(conn_idx).await;
            }
        }
    }

    fn wants_write(&self, idx: usize) -> bool {
        let conn = &self.connections[idx];
        match conn.state {
            ConnState::Connecting => true,
            ConnState::StatusChecking => conn
                .status_check
                .as_ref()
                .map(|sc| sc.request.assigned_id.is_none())
                .unwrap_or(false),
            ConnState::Active => !self.pending[idx].is_empty() || self.partial[idx].is_some(),
            _ => false,
        }
    }

    async fn next_io_event(&self) -> IoEvent {
        let mut futs: Vec<Pin<Box<dyn Future<Output = IoEvent> + Send + '_>>> = Vec::new();
        for (idx, conn) in self.connections.iter().enumerate() {
            if conn.state == ConnState::Closed || conn.state == ConnState::DeadRevive {
                continue;
            }
            futs.push(Box::pin(async move {
                let _ = conn.transport.readable().await;
                IoEvent::Readable(idx)
            }));
            if self.wants_write(idx) {
                futs.push(Box::pin(async move {
                    let _ = conn.transport.writable().await;
                    IoEvent::Writable(idx)
                }));
            }
        }
        if futs.is_empty() {
            std::future::pending::<IoEvent>().await
        } else {
            let (event, _idx, _rest) = futures::future::select_all(futs).await;
            event
        }
    }

    async fn handle_io_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Readable(idx) => self.on_readable(idx).await,
            IoEvent::Writable(idx) => self.on_writable(idx).await,
        }
    }

    async fn on_writable(&mut self, idx: usize) {
        let now = Instant::now();
        match self.connections[idx].state {
            ConnState::Connecting => {
                self.connections[idx].on_connect_writable(now);
                if self.connections[idx].state == ConnState::StatusChecking {
                    self.send_status_probe(idx, now).await;
                }
            }
            ConnState::StatusChecking => {
                self.send_status_probe(idx, now).await;
            }
            ConnState::Active => {
                self.connections[idx].write_blocked = false;
                self.drain_pending(idx, now).await;
            }
            _ => {}
        }
    }

    async fn drain_pending(&mut self, idx: usize, now: Instant) {
        loop {
            let id = match self.partial[idx] {
                Some(id) => id,
                None => match self.pending[idx].pop() {
                    Some((_, id)) => id,
                    None => break,
                },
            };
            if !self.write_entry(idx, id, now).await {
                break;
            }
        }
    }

    /// Writes (or resumes writing) one entry. Returns `true` if the caller
    /// should keep draining the connection's queue.
    async fn write_entry(&mut self, idx: usize, id: TrunkEntryId, now: Instant) -> bool {
        let needs_encode = self.entries[id.index()]
            .as_ref()
            .map(|e| e.request.encoded.is_none())
            .unwrap_or(true);
        if needs_encode {
            let Some(reserved) = self.connections[idx].id_tracker.reserve(id) else {
                // No free IDs: leave the request in pending, stop draining.
                self.pending[idx].push((
                    priority_key_of(&self.entries[id.index()]),
                    id,
                ));
                return false;
            };
            let (code, attrs, mut extra, require_ma) = {
                let entry = self.entries[id.index()].as_ref().unwrap();
                (
                    entry.request.code,
                    entry.request.attributes.clone(),
                    entry.request.extra_attributes.clone(),
                    entry.request.require_message_authenticator,
                )
            };
            // PROXY mode appends Proxy-State to the extra list, not the main
            // attribute list, so concurrent encodes never race on it.
            // Status checks never carry it.
            if self.config.mode == crate::config::Mode::Proxy {
                extra.push(crate::codec::Attribute {
                    kind: crate::codec::ATTR_PROXY_STATE,
                    value: self.config.proxy_state.to_vec(),
                });
            }
            let encoded = match self.codec.encode(code, reserved.id, &attrs, &extra, require_ma).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "encode failed, failing request");
                    self.connections[idx].id_tracker.release(reserved.id);
                    self.complete(id, ResultCode::Fail);
                    return true;
                }
            };
            let auth = extract_authenticator(&encoded);
            self.connections[idx].id_tracker.update(reserved.id, auth);
            if let Some(entry) = &mut self.entries[id.index()] {
                entry.request.assigned_id = Some(reserved.id);
                entry.request.encoded = Some(encoded);
            }
        }

        let bytes = self.entries[id.index()]
            .as_ref()
            .and_then(|e| e.request.encoded.clone())
            .unwrap_or_default();
        let offset = self.entries[id.index()]
            .as_ref()
            .map(|e| e.request.partial_offset)
            .unwrap_or(0);
        match self.connections[idx].transport.try_send(&bytes[offset..]) {
            Ok(n) if offset + n >= bytes.len() => {
                self.connections[idx].record_sent(now);
                self.partial[idx] = None;
                let policy = match &self.entries[id.index()] {
                    Some(entry) => Some(self.retry_policy_for(idx, &entry.request)),
                    None => None,
                };
                if let Some(entry) = &mut self.entries[id.index()] {
                    entry.state = EntryState::Sent;
                    entry.request.retry = policy.map(|p| RetryState::initial(p, now));
                }
                self.sent[idx].insert(id);
                true
            }
            Ok(n) => {
                if let Some(entry) = &mut self.entries[id.index()] {
                    entry.request.partial_offset = offset + n;
                    entry.state = EntryState::Partial;
                }
                self.partial[idx] = Some(id);
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.connections[idx].write_blocked = true;
                self.partial[idx] = Some(id);
                false
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                self.fail_connection(idx).await;
                false
            }
        }
    }

    /// Retry configuration from mode x code: a proxied request with a
    /// compatible parent, REPLICATE mode, or a stream-mode connection all
    /// wait out `timeout_retry` rather than actively retransmitting on
    /// `retry[code]`.
    fn retry_policy_for(&self, idx: usize, request: &ProtocolRequest) -> crate::config::RetryPolicy {
        if request.is_proxied
            || self.config.mode == crate::config::Mode::Replicate
            || self.connections[idx].transport.is_stream()
        {
            self.config.timeout_retry
        } else {
            self.config.retry_for(request.code)
        }
    }

    /// `require_message_authenticator` policy: `Yes` always verifies, `No`
    /// defers entirely to the per-request flag (set when the caller's
    /// attributes already included Message-Authenticator), and `Auto`
    /// verifies once this connection has ever observed a valid MA in a
    /// reply, in addition to the per-request flag.
    fn effective_require_ma(&self, idx: usize, request_require_ma: bool) -> bool {
        use crate::config::RequireMessageAuthenticator as Rma;
        match self.config.require_message_authenticator {
            Rma::Yes => true,
            Rma::No => request_require_ma,
            Rma::Auto => request_require_ma || self.connections[idx].require_message_authenticator_upgraded,
        }
    }

    /// AUTO upgrades to `Yes` after observing one valid Message-Authenticator
    /// in a reply, scoped to the connection that observed it.
    fn maybe_upgrade_require_ma(&mut self, idx: usize, decoded: &codec::DecodedReply) {
        if self.config.require_message_authenticator == crate::config::RequireMessageAuthenticator::Auto
            && decoded.has_message_authenticator()
        {
            self.connections[idx].require_message_authenticator_upgraded = true;
        }
    }

    async fn send_status_probe(&mut self, idx: usize, now: Instant) {
        if self.connections[idx].status_check.is_none() {
            return;
        }
        if let Some(old_id) = self.connections[idx]
            .status_check
            .as_ref()
            .and_then(|sc| sc.request.assigned_id)
        {
            self.connections[idx].id_tracker.release(old_id);
        }
        let Some(reserved) = self.connections[idx]
            .id_tracker
            .reserve(TrunkEntryId::STATUS_CHECK)
        else {
            warn!("status-check probe could not reserve an id");
            return;
        };
        let (code, attrs, extra, require_ma) = {
            let sc = self.connections[idx].status_check.as_ref().unwrap();
            (
                sc.request.code,
                sc.request.attributes.clone(),
                sc.request.extra_attributes.clone(),
                sc.request.require_message_authenticator,
            )
        };
        let encoded = match self.codec.encode(code, reserved.id, &attrs, &extra, require_ma).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "status-check encode failed");
                self.connections[idx].id_tracker.release(reserved.id);
                return;
            }
        };
        let auth = extract_authenticator(&encoded);
        self.connections[idx].id_tracker.update(reserved.id, auth);
        {
            let sc = self.connections[idx].status_check.as_mut().unwrap();
            sc.request.assigned_id = Some(reserved.id);
            sc.request.encoded = Some(encoded.clone());
        }
        match self.connections[idx].transport.try_send(&encoded) {
            Ok(_) => {
                self.connections[idx].record_sent(now);
                let config = Arc::clone(&self.config);
                self.connections[idx]
                    .status_check
                    .as_mut()
                    .unwrap()
                    .arm_probe_deadline(&config, now);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.connections[idx].write_blocked = true;
            }
            Err(e) => {
                warn!(error = %e, "status-check send failed");
                self.fail_connection(idx).await;
            }
        }
    }

    async fn on_readable(&mut self, idx: usize) {
        loop {
            let outcome = {
                let conn = &mut self.connections[idx];
                let buf_ptr = conn.recv_buf.as_mut_slice();
                conn.transport.try_recv(buf_ptr)
            };
            let n = match outcome {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "read failed");
                    self.fail_connection(idx).await;
                    break;
                }
            };
            self.handle_datagram(idx, n, Instant::now()).await;
        }
    }

    async fn handle_datagram(&mut self, idx: usize, n: usize, now: Instant) {
        let datagram = self.connections[idx].recv_buf[..n].to_vec();
        let Some(id_byte) = codec::peek_id(&datagram) else {
            return;
        };
        let Some(id_entry) = self.connections[idx].id_tracker.find(id_byte) else {
            debug!(id = id_byte, "dropping reply with unknown id (late reply)");
            return;
        };

        if id_entry.opaque_ctx.is_status_check() {
            self.handle_status_check_reply(idx, id_byte, &datagram, &id_entry.authenticator, now)
                .await;
            return;
        }

        let entry_id = id_entry.opaque_ctx;
        let request_require_ma = self.entries[entry_id.index()]
            .as_ref()
            .map(|e| e.request.require_message_authenticator)
            .unwrap_or(false);
        let original_code = self.entries[entry_id.index()]
            .as_ref()
            .map(|e| e.request.code);
        let require_ma = self.effective_require_ma(idx, request_require_ma);

        let decoded = match self.codec.decode(&datagram, &id_entry.authenticator, require_ma) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "decode failed, dropping reply");
                return;
            }
        };

        self.connections[idx].id_tracker.release(id_byte);
        self.sent[idx].remove(&entry_id);
        self.connections[idx].record_reply(now);
        self.maybe_upgrade_require_ma(idx, &decoded);

        if let Some(hint) = decoded.response_length_hint() {
            self.connections[idx].grow_recv_buffer(hint);
        }

        let mismatch = decoded.code == codec::code::PROTOCOL_ERROR
            && decoded
                .original_packet_code()
                .is_some_and(|c| Some(c) != original_code);
        let rcode = if mismatch {
            ResultCode::Fail
        } else {
            map_result_code(decoded.code)
        };
        self.complete(entry_id, rcode);
    }

    async fn handle_status_check_reply(
        &mut self,
        idx: usize,
        id_byte: u8,
        datagram: &[u8],
        authenticator: &[u8; 16],
        now: Instant,
    ) {
        // Status-check replies are accepted regardless of packet code
        // only AUTO/YES ever ask the codec to verify MA here.
        let require_ma = self.effective_require_ma(idx, false);
        let decoded = match self.codec.decode(datagram, authenticator, require_ma) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "status-check decode failed");
                return;
            }
        };
        self.connections[idx].id_tracker.release(id_byte);
        self.connections[idx].record_reply(now);
        self.maybe_upgrade_require_ma(idx, &decoded);
        if let Some(sc) = &mut self.connections[idx].status_check {
            sc.request.assigned_id = None;
        }
        let reply = self.connections[idx]
            .status_check
            .as_mut()
            .unwrap()
            .on_reply(&decoded);
        if let Some(hint) = reply.grow_hint {
            self.connections[idx].grow_recv_buffer(hint);
        }
        if reply.activated {
            self.connections[idx].mark_active_from_status_checking();
            self.assign_backlog();
        } else {
            self.send_status_probe(idx, now).await;
        }
    }

    fn complete(&mut self, id: TrunkEntryId, code: ResultCode) {
        if let Some(entry) = self.entries[id.index()].take() {
            self.free_entries.push(id.index() as u32);
            if let Some(resume) = entry.resume {
                let _ = resume.send(code);
            }
            self.metrics.completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Periodic sweep: retry timers, zombie/revive deadlines, status-check
    /// probe deadlines.
    pub async fn on_tick(&mut self, now: Instant) {
        self.sweep_retries(now).await;
        self.sweep_status_checks(now).await;
        self.sweep_zombies_and_revive(now).await;
        self.assign_backlog();
    }

    async fn sweep_retries(&mut self, now: Instant) {
        for idx in 0..self.connections.len() {
            let due: Vec<TrunkEntryId> = self.sent[idx]
                .iter()
                .copied()
                .filter(|id| {
                    self.entries[id.index()]
                        .as_ref()
                        .and_then(|e| e.request.retry.as_ref())
                        .map(|r| r.next_fire <= now)
                        .unwrap_or(false)
                })
                .collect();
            for id in due {
                self.fire_retry(idx, id, now).await;
            }
        }
    }

    async fn fire_retry(&mut self, idx: usize, id: TrunkEntryId, now: Instant) {
        let outcome = {
            let entry = match self.entries[id.index()].as_mut() {
                Some(e) => e,
                None => return,
            };
            entry.request.retry.as_mut().map(|r| r.next(now))
        };
        match outcome {
            Some(RetryOutcome::Continue) => {
                if self.sent[idx].contains(&id) && !self.connections[idx].write_blocked {
                    self.retransmit_sent_entry(idx, id).await;
                    self.metrics.retries_fired.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            Some(RetryOutcome::Exhausted(reason)) => {
                self.sent[idx].remove(&id);
                if let Some(assigned) = self.entries[id.index()]
                    .as_ref()
                    .and_then(|e| e.request.assigned_id)
                {
                    self.connections[idx].id_tracker.release(assigned);
                }
                self.complete(id, ResultCode::Fail);
                debug!(?reason, "retry exhausted");
                if self.config.mode != crate::config::Mode::Replicate {
                    let is_proxy = self.config.mode == crate::config::Mode::Proxy;
                    let last_sent = self.connections[idx].timestamps.last_sent;
                    let config = Arc::clone(&self.config);
                    check_for_zombie(&mut self.connections[idx], now, last_sent, is_proxy, &config);
                }
            }
            None => {}
        }
    }

    async fn sweep_status_checks(&mut self, now: Instant) {
        for idx in 0..self.connections.len() {
            if self.connections[idx].state != ConnState::StatusChecking {
                continue;
            }
            let due = self.connections[idx]
                .status_check
                .as_mut()
                .and_then(|sc| sc.probe_deadline_elapsed(now));
            match due {
                Some(RetryOutcome::Exhausted(reason)) => {
                    debug!(?reason, "status-check probe timed out, reconnecting");
                    if let Some(old_id) = self.connections[idx]
                        .status_check
                        .as_ref()
                        .and_then(|sc| sc.request.assigned_id)
                    {
                        self.connections[idx].id_tracker.release(old_id);
                    }
                    self.connections[idx]
                        .status_check
                        .as_mut()
                        .unwrap()
                        .on_failure();
                    self.connections[idx].status_check_failed_reconnect();
                    self.requeue_connection(idx);
                    let _ = self.connect(idx).await;
                }
                Some(RetryOutcome::Continue) | None => {}
            }
        }
    }

    async fn sweep_zombies_and_revive(&mut self, now: Instant) {
        for idx in 0..self.connections.len() {
            match self.connections[idx].state {
                ConnState::Active => {
                    let last_sent = self.connections[idx].timestamps.last_sent;
                    let is_proxy = self.config.mode == crate::config::Mode::Proxy;
                    let config = Arc::clone(&self.config);
                    if check_for_zombie(&mut self.connections[idx], now, last_sent, is_proxy, &config)
                        && self.connections[idx].state == ConnState::Zombie
                    {
                        self.requeue_connection(idx);
                        self.metrics.zombie_transitions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
                ConnState::Zombie if self.connections[idx].zombie_elapsed(now) => {
                    self.requeue_connection(idx);
                    let config = Arc::clone(&self.config);
                    self.connections[idx].arm_revive(now, &config);
                }
                ConnState::DeadRevive if self.connections[idx].revive_elapsed(now) => {
                    self.metrics.revive_attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let _ = self.connect(idx).await;
                }
                _ => {}
            }
        }
    }

    /// Moves every pending/partial/sent request on a dying connection back
    /// onto the backlog, releasing IDs.
    fn requeue_connection(&mut self, idx: usize) {
        let mut ids: Vec<TrunkEntryId> = self.sent[idx].drain().collect();
        if let Some(partial) = self.partial[idx].take() {
            ids.push(partial);
        }
        ids.extend(self.pending[idx].drain().map(|(_, id)| id));

        for id in ids {
            if let Some(assigned) = self.entries[id.index()]
                .as_ref()
                .and_then(|e| e.request.assigned_id)
            {
                self.connections[idx].id_tracker.release(assigned);
            }
            if let Some(entry) = &mut self.entries[id.index()] {
                entry.request.encoded = None;
                entry.request.partial_offset = 0;
                entry.request.assigned_id = None;
                entry.request.retry = None;
                entry.state = EntryState::Backlog;
                entry.conn = None;
                let key = priority_key(
                    entry.request.is_status_check,
                    entry.request.priority,
                    entry.request.recv_time,
                );
                self.backlog.push((key, id));
            }
        }
    }

    fn fail_connection_sync(&mut self, idx: usize) {
        self.requeue_connection(idx);
        self.connections[idx].state = ConnState::Connecting;
        self.connections[idx].write_blocked = false;
    }

    async fn fail_connection(&mut self, idx: usize) {
        self.fail_connection_sync(idx);
        let _ = self.connect(idx).await;
    }

    /// Issues a connect attempt on one connection. In REPLICATE mode the
    /// socket transitions to write-only right after connect — replicated
    /// requests are fire-and-forget, so the connection never needs a read
    /// half.
    async fn connect(&mut self, idx: usize) -> std::io::Result<()> {
        self.connections[idx].begin_connect().await?;
        if self.config.mode == crate::config::Mode::Replicate {
            self.connections[idx].transport.make_write_only();
        }
        Ok(())
    }

    /// Drives every connection's initial connect attempt.
    async fn connect_all(&mut self) {
        for idx in 0..self.connections.len() {
            let _ = self.connect(idx).await;
        }
    }

    /// Runs the single-threaded cooperative event loop for this worker
    /// until the command channel closes.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Command>) {
        self.connect_all().await;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                event = self.next_io_event() => {
                    self.handle_io_event(event).await;
                }
                cmd = inbound.recv() => {
                    match cmd {
                        Some(Command::Submit { request, resume, reply }) => {
                            let (outcome, id) = self.enqueue(request, resume);
                            let _ = reply.send((outcome, id));
                        }
                        Some(Command::Cancel(id)) => self.cancel(id).await,
                        Some(Command::Dup(id)) => self.on_dup(id, Instant::now()).await,
                        Some(Command::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.on_tick(Instant::now()).await;
                }
            }
        }
        info!("trunk event loop stopped");
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TrunkSnapshot {
    pub connections: Vec<crate::connection::ConnectionSnapshot>,
    pub backlog_len: usize,
    pub outstanding: usize,
    pub metrics: crate::metrics::TrunkMetricsSnapshot,
}

impl TrunkSnapshot {
    /// `serde_json::Value` rendering for introspection endpoints, mirroring
    /// the plain `serde_json::Value` snapshot pattern used elsewhere in this
    /// crate for introspection endpoints.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn priority_key_of(entry: &Option<TrunkEntry>) -> PriorityKey {
    match entry {
        Some(e) => priority_key(e.request.is_status_check, e.request.priority, e.request.recv_time),
        None => priority_key(false, 0, Instant::now()),
    }
}

fn extract_authenticator(bytes: &[u8]) -> [u8; 16] {
    let mut auth = [0u8; 16];
    let start = codec::AUTHENTICATOR_OFFSET;
    if bytes.len() >= start + 16 {
        auth.copy_from_slice(&bytes[start..start + 16]);
    }
    auth
}

fn map_result_code(code: u8) -> ResultCode {
    use codec::code as c;
    match code {
        c::ACCESS_ACCEPT | c::ACCOUNTING_RESPONSE | c::COA_ACK | c::DISCONNECT_ACK => ResultCode::Ok,
        c::ACCESS_CHALLENGE => ResultCode::Updated,
        c::ACCESS_REJECT | c::COA_NAK | c::DISCONNECT_NAK => ResultCode::Reject,
        c::PROTOCOL_ERROR => ResultCode::Handled,
        _ => ResultCode::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::NullCodec;
    use crate::config::Mode;
    use crate::transport::test_support::{FakeTransport, FakeWire};
    use std::time::Instant;

    fn config() -> Config {
        let mut c = Config::default();
        c.status_check_code = None;
        c.connections = 1;
        c
    }

    fn make_trunk() -> (Trunk<FakeTransport>, FakeWire) {
        let wire = FakeWire::default();
        let trunk = Trunk::new(
            config(),
            Arc::new(NullCodec::default()),
            vec![FakeTransport::new(wire.clone())],
        );
        (trunk, wire)
    }

    #[tokio::test]
    async fn happy_path_access_accept_resumes_ok() {
        let (mut trunk, wire) = make_trunk();
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());
        assert_eq!(trunk.connections[0].state, ConnState::Active);

        let (resume_tx, resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 100, Instant::now());
        let (outcome, _id) = trunk.enqueue(request, resume_tx);
        assert_eq!(outcome, EnqueueOutcome::Ok);

        trunk.drain_pending(0, Instant::now()).await;
        let sent = wire.take_sent();
        assert_eq!(sent.len(), 1);

        let id = sent[0][codec::ID_OFFSET];
        let mut reply = vec![0u8; codec::HEADER_LEN];
        reply[0] = codec::code::ACCESS_ACCEPT;
        reply[codec::ID_OFFSET] = id;
        wire.push_reply(reply);

        trunk.on_readable(0).await;
        assert_eq!(resume_rx.await.unwrap(), ResultCode::Ok);
    }

    #[tokio::test]
    async fn proxy_mode_appends_proxy_state_attribute_at_encode_time() {
        use crate::codec::test_support::AttributeCodec;
        use crate::codec::ATTR_PROXY_STATE;

        let wire = FakeWire::default();
        let mut cfg = config();
        cfg.mode = Mode::Proxy;
        cfg.proxy_state = [1, 2, 3, 4];
        let mut trunk = Trunk::new(cfg, Arc::new(AttributeCodec), vec![FakeTransport::new(wire.clone())]);
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());

        let (resume_tx, _resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        trunk.enqueue(request, resume_tx);
        trunk.drain_pending(0, Instant::now()).await;

        let sent = wire.take_sent();
        let attrs = crate::codec::test_support::decode_attributes(&sent[0][codec::HEADER_LEN..]);
        let proxy_state = attrs.iter().find(|a| a.kind == ATTR_PROXY_STATE).unwrap();
        assert_eq!(proxy_state.value, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn auto_policy_upgrades_after_observing_a_valid_message_authenticator() {
        use crate::codec::test_support::AttributeCodec;
        use crate::codec::{Attribute, ATTR_MESSAGE_AUTHENTICATOR};

        let wire = FakeWire::default();
        let mut trunk = Trunk::new(config(), Arc::new(AttributeCodec), vec![FakeTransport::new(wire.clone())]);
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());
        assert!(!trunk.connections[0].require_message_authenticator_upgraded);

        let (resume_tx, _resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        trunk.enqueue(request, resume_tx);
        trunk.drain_pending(0, Instant::now()).await;
        let sent = wire.take_sent();

        let mut reply = vec![0u8; codec::HEADER_LEN];
        reply[0] = codec::code::ACCESS_ACCEPT;
        reply[codec::ID_OFFSET] = sent[0][codec::ID_OFFSET];
        crate::codec::test_support::encode_attributes(
            &mut reply,
            &[Attribute {
                kind: ATTR_MESSAGE_AUTHENTICATOR,
                value: vec![0; 16],
            }],
        );
        let len = reply.len() as u16;
        reply[codec::LENGTH_OFFSET..codec::LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
        wire.push_reply(reply);

        trunk.on_readable(0).await;
        assert!(trunk.connections[0].require_message_authenticator_upgraded);
    }

    #[tokio::test]
    async fn capacity_exhausted_rejects_enqueue() {
        let (mut trunk, _wire) = make_trunk();
        trunk.config = Arc::new({
            let mut c = config();
            c.max_backlog = 0;
            c
        });
        let (resume_tx, _rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        assert_eq!(trunk.enqueue(request, resume_tx).0, EnqueueOutcome::NoCapacity);
    }

    #[tokio::test]
    async fn dead_connection_reports_destination_unavailable() {
        let (mut trunk, _wire) = make_trunk();
        trunk.connections[0].state = ConnState::Closed;
        let (resume_tx, _rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        assert_eq!(
            trunk.enqueue(request, resume_tx).0,
            EnqueueOutcome::DstUnavailable
        );
    }

    #[tokio::test]
    async fn cancel_releases_reserved_id_and_resumes_fail() {
        let (mut trunk, _wire) = make_trunk();
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());

        let (resume_tx, resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        trunk.enqueue(request, resume_tx);
        trunk.drain_pending(0, Instant::now()).await;
        assert_eq!(trunk.connections[0].id_tracker.count(), 1);

        let id = TrunkEntryId::new(0);
        trunk.cancel(id).await;
        assert_eq!(trunk.connections[0].id_tracker.count(), 0);
        assert_eq!(resume_rx.await.unwrap(), ResultCode::Fail);
    }

    #[tokio::test]
    async fn requeue_connection_returns_sent_entries_to_backlog() {
        let (mut trunk, _wire) = make_trunk();
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());

        let (resume_tx, _resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        trunk.enqueue(request, resume_tx);
        trunk.drain_pending(0, Instant::now()).await;
        assert_eq!(trunk.sent[0].len(), 1);

        trunk.requeue_connection(0);
        assert_eq!(trunk.sent[0].len(), 0);
        assert_eq!(trunk.backlog.len(), 1);
        assert_eq!(trunk.connections[0].id_tracker.count(), 0);
    }

    #[tokio::test]
    async fn replicate_mode_makes_the_connection_write_only_after_connect() {
        let wire = FakeWire::default();
        let mut cfg = config();
        cfg.mode = Mode::Replicate;
        let mut trunk = Trunk::new(cfg, Arc::new(NullCodec::default()), vec![FakeTransport::new(wire.clone())]);
        trunk.connect(0).await.unwrap();
        assert!(wire.is_write_only());
    }

    #[tokio::test]
    async fn stream_mode_connection_never_arms_per_code_retry() {
        let wire = FakeWire::default();
        let mut trunk = Trunk::new(
            config(),
            Arc::new(NullCodec::default()),
            vec![FakeTransport::new_stream(wire.clone())],
        );
        trunk.connections[0].begin_connect().await.unwrap();
        trunk.connections[0].on_connect_writable(Instant::now());

        let (resume_tx, _resume_rx) = oneshot::channel();
        let request = ProtocolRequest::new(codec::code::ACCESS_REQUEST, 1, Instant::now());
        trunk.enqueue(request, resume_tx);
        trunk.drain_pending(0, Instant::now()).await;

        let id = TrunkEntryId::new(0);
        let retry = trunk.entries[id.index()]
            .as_ref()
            .unwrap()
            .request
            .retry
            .unwrap();
        assert_eq!(retry.config, trunk.config.timeout_retry);
    }

    #[test]
    fn result_code_table_matches_spec() {
        use codec::code as c;
        assert_eq!(map_result_code(c::ACCESS_ACCEPT), ResultCode::Ok);
        assert_eq!(map_result_code(c::ACCESS_CHALLENGE), ResultCode::Updated);
        assert_eq!(map_result_code(c::ACCESS_REJECT), ResultCode::Reject);
        assert_eq!(map_result_code(c::PROTOCOL_ERROR), ResultCode::Handled);
        assert_eq!(map_result_code(200), ResultCode::Fail);
    }

    #[test]
    fn snapshot_renders_to_json() {
        let (trunk, _wire) = make_trunk();
        let json = trunk.snapshot().to_json();
        assert!(json.get("backlog_len").is_some());
    }

    #[allow(dead_code)]
    fn assert_mode_is_used(_m: Mode) {}
}
