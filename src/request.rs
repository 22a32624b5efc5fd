//! `ProtocolRequest`, the one-per-exchange unit the trunk tracks. A
//! separate result-slot type (result code, trunk-entry back-reference,
//! is-retry flag) is folded directly into `crate::trunk::TrunkEntry` plus
//! the `oneshot::Sender<ResultCode>` the Dispatcher hands in at enqueue
//! time, rather than kept as its own type — the trunk entry table already
//! is the back-reference, and a dropped `oneshot::Sender` is a cheaper "no
//! result yet" than an `Option<ResultCode>`.

use std::time::Instant;

use crate::codec::Attribute;
use crate::retry::RetryState;

/// One logical RADIUS exchange. Created by the Dispatcher; mutated by
/// Trunk/Connection; destroyed when the Dispatcher resumes its caller, or
/// reset-in-place if it is a status-check request (those are reused, never
/// freed).
#[derive(Debug, Clone)]
pub struct ProtocolRequest {
    pub code: u8,
    pub priority: u32,
    pub recv_time: Instant,
    pub require_message_authenticator: bool,
    pub is_status_check: bool,
    pub is_proxied: bool,
    pub attributes: Vec<Attribute>,
    /// Attributes appended at encode time (e.g. Proxy-State), kept separate
    /// from `attributes` so concurrent encodes never race on them.
    pub extra_attributes: Vec<Attribute>,
    /// Populated lazily on first encode; reused verbatim on retransmit.
    pub encoded: Option<Vec<u8>>,
    /// Byte offset already written to the wire, for a partially-written
    /// stream-mode send.
    pub partial_offset: usize,
    /// Valid only while held by an `IdTracker`.
    pub assigned_id: Option<u8>,
    pub retry: Option<RetryState>,
}

impl ProtocolRequest {
    pub fn new(code: u8, priority: u32, recv_time: Instant) -> Self {
        Self {
            code,
            priority,
            recv_time,
            require_message_authenticator: false,
            is_status_check: false,
            is_proxied: false,
            attributes: Vec::new(),
            extra_attributes: Vec::new(),
            encoded: None,
            partial_offset: 0,
            assigned_id: None,
            retry: None,
        }
    }

    /// Resets a status-check request in place for its next probe: its ID is
    /// reassigned on each send, so each probe uses a fresh ID. Never used on
    /// a normal request.
    pub fn reset_for_next_probe(&mut self, now: Instant) {
        debug_assert!(self.is_status_check);
        self.encoded = None;
        self.partial_offset = 0;
        self.assigned_id = None;
        self.retry = None;
        self.recv_time = now;
        self.extra_attributes.clear();
    }
}

/// State of a [`ProtocolRequest`] within the trunk's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Backlog,
    Pending,
    Partial,
    Sent,
}

/// Priority comparator: status-check requests always win;
/// among non-status-checks, a larger `priority` wins; ties break toward the
/// earlier `recv_time`. Total order over `{status_check, priority, recv_time}`.
///
/// `Reverse` on `recv_time` so that, within a `BinaryHeap` (a max-heap), the
/// earliest time compares greatest (i.e. wins), matching "smaller recv_time
/// is more important".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityKey(bool, u32, std::cmp::Reverse<Instant>);

pub fn priority_key(is_status_check: bool, priority: u32, recv_time: Instant) -> PriorityKey {
    PriorityKey(is_status_check, priority, std::cmp::Reverse(recv_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_check_always_outranks_normal_requests() {
        let now = Instant::now();
        let status = priority_key(true, 0, now);
        let normal = priority_key(false, u32::MAX, now);
        assert!(status > normal);
    }

    #[test]
    fn higher_priority_field_wins_among_normal_requests() {
        let now = Instant::now();
        let high = priority_key(false, 100, now);
        let low = priority_key(false, 1, now);
        assert!(high > low);
    }

    #[test]
    fn earlier_recv_time_wins_ties() {
        let now = Instant::now();
        let earlier = priority_key(false, 50, now);
        let later = priority_key(false, 50, now + Duration::from_millis(1));
        assert!(earlier > later);
    }

    #[test]
    fn comparator_is_a_total_order() {
        let now = Instant::now();
        let a = priority_key(false, 10, now);
        let b = priority_key(false, 10, now);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }
}
