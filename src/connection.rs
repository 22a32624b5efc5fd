//! Per-connection liveness state machine.
//!
//! Seven states covering connect, optional status-check probing, active
//! service, and the zombie/revive path back from a dead-looking peer. Owns
//! a real socket, an `IdTracker`, and the receive buffer.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::id_tracker::IdTracker;
use crate::status_check::StatusCheck;
use crate::transport::Transport;

/// Tagged variant, no virtual dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    StatusChecking,
    Active,
    Zombie,
    DeadRevive,
    Closed,
}

/// Monotonic timestamps a Connection tracks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamps {
    pub last_reply: Option<Instant>,
    pub first_sent: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub last_idle: Option<Instant>,
    pub mrs_time: Option<Instant>,
}

/// Owns one socket, one receive buffer, one `IdTracker`, and the liveness
/// state machine.
pub struct Connection<T: Transport> {
    pub transport: T,
    pub recv_buf: Vec<u8>,
    pub id_tracker: IdTracker,
    pub state: ConnState,
    pub timestamps: Timestamps,
    pub write_blocked: bool,
    /// Armed when a Connection goes ACTIVE -> ZOMBIE with status checks
    /// disabled; fires `revive_interval` after expiry.
    pub zombie_deadline: Option<Instant>,
    pub revive_deadline: Option<Instant>,
    pub status_check: Option<StatusCheck>,
    /// AUTO upgrades to `Yes` after observing one valid MA in a reply
    /// Tracked per-connection since negotiation is scoped to
    /// one socket's observed traffic.
    pub require_message_authenticator_upgraded: bool,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        let status_check = config
            .status_check_code
            .map(|code| StatusCheck::new(code, config));
        Self {
            transport,
            recv_buf: vec![0u8; config.max_packet_size],
            id_tracker: IdTracker::new(),
            state: ConnState::Init,
            timestamps: Timestamps::default(),
            write_blocked: false,
            zombie_deadline: None,
            revive_deadline: None,
            status_check,
            require_message_authenticator_upgraded: false,
        }
    }

    pub fn status_checks_enabled(&self) -> bool {
        self.status_check.is_some()
    }

    /// INIT -> CONNECTING: socket created, nonblocking connect issued.
    pub async fn begin_connect(&mut self) -> std::io::Result<()> {
        debug_assert_eq!(self.state, ConnState::Init);
        self.state = ConnState::Connecting;
        self.transport.connect().await
    }

    /// CONNECTING -> ACTIVE or STATUS_CHECKING, upon socket writable.
    pub fn on_connect_writable(&mut self, now: Instant) {
        debug_assert_eq!(self.state, ConnState::Connecting);
        if self.status_checks_enabled() {
            self.state = ConnState::StatusChecking;
            if let Some(sc) = &mut self.status_check {
                sc.reset_for_connect(now);
            }
        } else {
            self.state = ConnState::Active;
        }
        self.timestamps.last_idle = Some(now);
    }

    /// STATUS_CHECKING -> ACTIVE after `num_answers_to_alive` valid replies.
    pub fn mark_active_from_status_checking(&mut self) {
        debug_assert_eq!(self.state, ConnState::StatusChecking);
        self.state = ConnState::Active;
    }

    /// STATUS_CHECKING -> CONNECTING: retry hit MRC/MRD, or a read error.
    pub fn status_check_failed_reconnect(&mut self) {
        self.state = ConnState::Connecting;
        self.write_blocked = false;
    }

    /// ACTIVE -> ZOMBIE: no reply within `response_window` after a send, and
    /// we are not already status-checking.
    pub fn mark_zombie(&mut self, now: Instant, config: &Config) {
        debug_assert_eq!(self.state, ConnState::Active);
        self.state = ConnState::Zombie;
        if self.status_checks_enabled() {
            if let Some(sc) = &mut self.status_check {
                sc.reset_for_connect(now);
            }
            self.state = ConnState::StatusChecking;
        } else {
            self.zombie_deadline = Some(now + config.zombie_period);
        }
    }

    /// ZOMBIE -> DEAD_REVIVE: status checks disabled, wait `revive_interval`.
    pub fn arm_revive(&mut self, now: Instant, config: &Config) {
        self.state = ConnState::DeadRevive;
        self.revive_deadline = Some(now + config.revive_interval);
    }

    /// DEAD_REVIVE -> CONNECTING after `revive_interval` elapses.
    pub fn revive_elapsed(&mut self, now: Instant) -> bool {
        match self.revive_deadline {
            Some(deadline) if now >= deadline => {
                self.state = ConnState::Connecting;
                self.revive_deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn zombie_elapsed(&self, now: Instant) -> bool {
        matches!(self.zombie_deadline, Some(deadline) if now >= deadline)
    }

    /// Any -> CLOSED on shutdown; caller must have already drained the
    /// IdTracker (its count must already be zero).
    pub async fn close(&mut self) -> std::io::Result<()> {
        debug_assert_eq!(self.id_tracker.count(), 0);
        self.state = ConnState::Closed;
        self.transport.shutdown().await
    }

    pub fn is_idle(&self) -> bool {
        self.timestamps.first_sent.is_none()
    }

    pub fn record_sent(&mut self, now: Instant) {
        if self.is_idle() {
            self.timestamps.first_sent = Some(now);
        }
        self.timestamps.last_sent = Some(now);
    }

    pub fn record_reply(&mut self, now: Instant) {
        self.timestamps.last_reply = Some(now);
    }

    /// Grows the receive buffer in response to a Protocol-Error Response-Length
    /// hint, clamped to `[4096, 65535]`.
    pub fn grow_recv_buffer(&mut self, response_length: u32) {
        let clamped = response_length.clamp(4096, 65535) as usize;
        if clamped > self.recv_buf.len() {
            debug!(new_size = clamped, "growing receive buffer on Protocol-Error hint");
            self.recv_buf.resize(clamped, 0);
        }
    }

    /// Serializable snapshot for introspection.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            ids_in_use: self.id_tracker.count(),
            write_blocked: self.write_blocked,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSnapshot {
    #[serde(with = "conn_state_serde")]
    pub state: ConnState,
    pub ids_in_use: usize,
    pub write_blocked: bool,
}

mod conn_state_serde {
    use super::ConnState;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(state: &ConnState, s: S) -> Result<S::Ok, S::Error> {
        let name = match state {
            ConnState::Init => "init",
            ConnState::Connecting => "connecting",
            ConnState::StatusChecking => "status_checking",
            ConnState::Active => "active",
            ConnState::Zombie => "zombie",
            ConnState::DeadRevive => "dead_revive",
            ConnState::Closed => "closed",
        };
        s.serialize_str(name)
    }
}

/// `check_for_zombie`, pulled out as a free function since it needs the
/// caller-supplied `last_sent` reading as well as the connection's own
/// `last_reply` — it is invoked both from the Dispatcher's DUP/retry paths
/// and from the trunk's read-timeout sweep.
pub fn check_for_zombie<T: Transport>(
    conn: &mut Connection<T>,
    now: Instant,
    last_sent: Option<Instant>,
    is_proxy_mode: bool,
    config: &Config,
) -> bool {
    if conn.state == ConnState::StatusChecking || conn.zombie_deadline.is_some() {
        return true;
    }
    if let (Some(reply), Some(sent)) = (conn.timestamps.last_reply, last_sent) {
        if reply >= sent {
            return false;
        }
    }
    if is_proxy_mode {
        // "if last_sent > 0" — i.e. the connection has sent at least once,
        // which `Some(sent)` already encodes.
        if let Some(sent) = last_sent {
            if now.saturating_duration_since(sent) >= config.response_window {
                if conn.state == ConnState::Active {
                    conn.mark_zombie(now, config);
                }
                return true;
            }
        }
        return false;
    }
    if conn.state == ConnState::Active {
        if let Some(sent) = last_sent {
            if now.saturating_duration_since(sent) >= config.response_window {
                conn.mark_zombie(now, config);
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{FakeTransport, FakeWire};

    fn config() -> Config {
        Config::default()
    }

    fn make_conn() -> Connection<FakeTransport> {
        let wire = FakeWire::default();
        Connection::new(FakeTransport::new(wire), &config())
    }

    #[tokio::test]
    async fn init_to_connecting_to_status_checking() {
        let mut conn = make_conn();
        conn.begin_connect().await.unwrap();
        assert_eq!(conn.state, ConnState::Connecting);
        conn.on_connect_writable(Instant::now());
        assert_eq!(conn.state, ConnState::StatusChecking);
    }

    #[tokio::test]
    async fn connecting_to_active_when_status_checks_disabled() {
        let mut cfg = config();
        cfg.status_check_code = None;
        let wire = FakeWire::default();
        let mut conn = Connection::new(FakeTransport::new(wire), &cfg);
        conn.begin_connect().await.unwrap();
        conn.on_connect_writable(Instant::now());
        assert_eq!(conn.state, ConnState::Active);
    }

    #[test]
    fn active_to_zombie_requires_response_window_elapsed() {
        let mut conn = make_conn();
        conn.state = ConnState::Active;
        let now = Instant::now();
        let cfg = config();
        conn.mark_zombie(now, &cfg);
        assert_eq!(conn.state, ConnState::StatusChecking);
    }

    #[test]
    fn zombie_without_status_checks_arms_revive_after_period() {
        let mut cfg = config();
        cfg.status_check_code = None;
        let wire = FakeWire::default();
        let mut conn = Connection::new(FakeTransport::new(wire), &cfg);
        conn.state = ConnState::Active;
        let now = Instant::now();
        conn.mark_zombie(now, &cfg);
        assert_eq!(conn.state, ConnState::Zombie);
        assert!(conn.zombie_elapsed(now + cfg.zombie_period + Duration::from_millis(1)));
        conn.arm_revive(now, &cfg);
        assert_eq!(conn.state, ConnState::DeadRevive);
        assert!(conn.revive_elapsed(now + cfg.revive_interval + Duration::from_millis(1)));
        assert_eq!(conn.state, ConnState::Connecting);
    }

    #[test]
    fn grow_recv_buffer_clamps_to_bounds() {
        let mut conn = make_conn();
        conn.grow_recv_buffer(8000);
        assert_eq!(conn.recv_buf.len(), 8000);
        conn.grow_recv_buffer(999_999);
        assert_eq!(conn.recv_buf.len(), 65535);
    }
}
