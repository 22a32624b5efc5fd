//! Synthetic liveness probe bound to a connection.

use std::time::Instant;

use crate::codec::{Attribute, DecodedReply, ATTR_ERROR_CAUSE, ERROR_CAUSE_RESPONSE_TOO_BIG};
use crate::config::Config;
use crate::request::ProtocolRequest;
use crate::retry::{RetryOutcome, RetryState};

/// A status-check ProtocolRequest built once per Connection from a
/// configured attribute template, reused across probes. Always
/// `priority = MAX`, `is_status_check = true`.
pub struct StatusCheck {
    pub request: ProtocolRequest,
    /// Contiguous good replies observed since the last failure.
    good_replies: u32,
    num_answers_to_alive: u32,
}

impl StatusCheck {
    pub fn new(code: u8, config: &Config) -> Self {
        let mut request = ProtocolRequest::new(code, u32::MAX, Instant::now());
        request.is_status_check = true;
        Self {
            request,
            good_replies: 0,
            num_answers_to_alive: config.num_answers_to_alive,
        }
    }

    /// Invoked whenever a connection (re)enters STATUS_CHECKING. The number
    /// of contiguous good replies required is always the configured N — "1 if
    /// no prior failure" is left to the operator's choice of N, since the
    /// crate has no notion of "this is the Connection's first ever
    /// activation" beyond what the caller configures.
    pub fn reset_for_connect(&mut self, now: Instant) {
        self.good_replies = 0;
        self.request.reset_for_next_probe(now);
    }

    pub fn attributes_template(&self) -> &[Attribute] {
        &self.request.attributes
    }

    pub fn set_attributes_template(&mut self, attrs: Vec<Attribute>) {
        self.request.attributes = attrs;
    }

    /// Outcome of one status-check reply: replies are accepted regardless of
    /// packet code, including Protocol-Error, which counts toward liveness
    /// the same as any other reply but additionally carries a buffer-growth
    /// hint the caller applies to the connection.
    pub fn on_reply(&mut self, reply: &DecodedReply) -> StatusCheckReply {
        let grow_hint = reply.response_length_hint();
        self.good_replies += 1;
        let activated = self.good_replies >= self.num_answers_to_alive;
        StatusCheckReply { activated, grow_hint }
    }

    pub fn on_failure(&mut self) {
        self.good_replies = 0;
    }

    pub fn good_replies(&self) -> u32 {
        self.good_replies
    }

    /// Status checks are never retransmitted: each probe uses a fresh retry
    /// schedule only to bound how long we wait before declaring the probe
    /// itself failed (MRC/MRD still apply as the probe's own deadline).
    pub fn arm_probe_deadline(&mut self, config: &Config, now: Instant) {
        self.request.retry = Some(RetryState::initial(config.timeout_retry, now));
    }

    pub fn probe_deadline_elapsed(&mut self, now: Instant) -> Option<RetryOutcome> {
        self.request.retry.as_mut().map(|r| r.next(now))
    }
}

/// Outcome of one status-check reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCheckReply {
    /// `good_replies` just reached `num_answers_to_alive`; caller should move
    /// the connection STATUS_CHECKING -> ACTIVE.
    pub activated: bool,
    /// Error-Cause=601 + Response-Length seen; caller should enlarge the
    /// connection's receive buffer to `clamp(response_length, 4096, 65535)`.
    pub grow_hint: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::code;

    fn config() -> Config {
        let mut c = Config::default();
        c.num_answers_to_alive = 2;
        c
    }

    #[test]
    fn becomes_active_after_configured_contiguous_replies() {
        let mut sc = StatusCheck::new(code::STATUS_SERVER, &config());
        let ok = DecodedReply {
            code: code::ACCESS_ACCEPT,
            attributes: vec![],
        };
        assert!(!sc.on_reply(&ok).activated);
        assert!(sc.on_reply(&ok).activated);
    }

    #[test]
    fn failure_resets_contiguous_count() {
        let mut sc = StatusCheck::new(code::STATUS_SERVER, &config());
        let ok = DecodedReply {
            code: code::ACCESS_ACCEPT,
            attributes: vec![],
        };
        sc.on_reply(&ok);
        sc.on_failure();
        assert_eq!(sc.good_replies(), 0);
    }

    #[test]
    fn protocol_error_with_response_length_yields_grow_hint_and_still_counts() {
        let mut sc = StatusCheck::new(code::STATUS_SERVER, &config());
        let reply = DecodedReply {
            code: code::PROTOCOL_ERROR,
            attributes: vec![
                Attribute {
                    kind: ATTR_ERROR_CAUSE,
                    value: ERROR_CAUSE_RESPONSE_TOO_BIG.to_be_bytes().to_vec(),
                },
                Attribute {
                    kind: 200,
                    value: 12000u32.to_be_bytes().to_vec(),
                },
            ],
        };
        let outcome = sc.on_reply(&reply);
        assert_eq!(outcome.grow_hint, Some(12000));
        assert_eq!(sc.good_replies(), 1);
    }
}
