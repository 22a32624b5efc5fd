//! Configuration surface for one trunk.
//!
//! A plain, `Serialize`/`Deserialize` struct with a `Default` impl and a
//! small set of named presets, plus an explicit `validate()` the embedding
//! server calls once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::RadiusClientError;

/// Selects retry policy and read/write direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Client,
    Proxy,
    Replicate,
}

/// Whether Message-Authenticator is required on replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequireMessageAuthenticator {
    Yes,
    No,
    /// Upgrades to `Yes` after observing one valid Message-Authenticator in a reply.
    Auto,
}

/// (initial_rt, max_rt, mrc, mrd) retry shape for one packet code, or for
/// `timeout_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_rt: Duration,
    pub max_rt: Duration,
    /// Maximum retransmit count. `count > mrc` fails the request.
    pub mrc: u32,
    /// Maximum retransmit duration, measured from the first send.
    pub mrd: Duration,
}

impl RetryPolicy {
    /// The shape FreeRADIUS-style clients use for confirmed UDP exchanges.
    pub const fn datagram_default() -> Self {
        Self {
            initial_rt: Duration::from_millis(2000),
            max_rt: Duration::from_millis(16000),
            mrc: 5,
            mrd: Duration::from_secs(30),
        }
    }

    /// Used for proxied requests with an upstream parent, and for REPLICATE
    /// mode: the transport never actively retransmits, only waits out the
    /// window.
    pub const fn timeout_only(window: Duration) -> Self {
        Self {
            initial_rt: window,
            max_rt: window,
            mrc: 0,
            mrd: window,
        }
    }

    fn validate(&self) -> Result<(), RadiusClientError> {
        if self.initial_rt.is_zero() {
            return Err(RadiusClientError::InvalidConfig(
                "initial_rt must be > 0".into(),
            ));
        }
        if self.max_rt < self.initial_rt {
            return Err(RadiusClientError::InvalidConfig(
                "max_rt must be >= initial_rt".into(),
            ));
        }
        if self.mrd.is_zero() {
            return Err(RadiusClientError::InvalidConfig("mrd must be > 0".into()));
        }
        Ok(())
    }
}

/// Top-level, immutable-after-instantiate configuration for one trunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    /// `Some(code)` enables status checks using this RADIUS packet code;
    /// `None` disables them.
    pub status_check_code: Option<u8>,
    pub num_answers_to_alive: u32,
    pub zombie_period: Duration,
    pub revive_interval: Duration,
    pub response_window: Duration,
    pub retry: HashMap<u8, RetryPolicy>,
    pub timeout_retry: RetryPolicy,
    pub max_packet_size: usize,
    pub require_message_authenticator: RequireMessageAuthenticator,
    pub allowed_codes: Vec<u8>,
    /// Proxy-State value this trunk appends to outgoing requests in PROXY mode.
    pub proxy_state: [u8; 4],
    /// Upper bound on in-flight + backlogged requests for the whole trunk.
    pub max_backlog: usize,
    /// Connections to open to the destination.
    pub connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            status_check_code: Some(12), // Status-Server
            num_answers_to_alive: 3,
            zombie_period: Duration::from_secs(30),
            revive_interval: Duration::from_secs(60),
            response_window: Duration::from_secs(5),
            retry: HashMap::new(),
            timeout_retry: RetryPolicy::timeout_only(Duration::from_secs(5)),
            max_packet_size: 4096,
            require_message_authenticator: RequireMessageAuthenticator::Auto,
            allowed_codes: Vec::new(),
            proxy_state: [0; 4],
            max_backlog: 65536,
            connections: 1,
        }
    }
}

impl Config {
    /// Retry policy to use for a given code under `CLIENT` mode (or any mode
    /// that is not `timeout_retry`-driven). Falls back to the datagram default
    /// if the operator never configured this code explicitly.
    pub fn retry_for(&self, code: u8) -> RetryPolicy {
        self.retry
            .get(&code)
            .copied()
            .unwrap_or_else(RetryPolicy::datagram_default)
    }

    pub fn status_checks_enabled(&self) -> bool {
        self.status_check_code.is_some()
    }

    /// Eager validation the embedding server runs once at startup (§11 of
    /// a config struct should not be able to produce a nonsensical value).
    pub fn validate(&self) -> Result<(), RadiusClientError> {
        if self.connections == 0 {
            return Err(RadiusClientError::InvalidConfig(
                "connections must be >= 1".into(),
            ));
        }
        if !(4096..=65535).contains(&self.max_packet_size) {
            return Err(RadiusClientError::InvalidConfig(
                "max_packet_size must be within [4096, 65535]".into(),
            ));
        }
        if self.status_checks_enabled() && self.num_answers_to_alive == 0 {
            return Err(RadiusClientError::InvalidConfig(
                "num_answers_to_alive must be >= 1 when status checks are enabled".into(),
            ));
        }
        if self.zombie_period.is_zero() {
            return Err(RadiusClientError::InvalidConfig(
                "zombie_period must be > 0".into(),
            ));
        }
        if self.revive_interval.is_zero() {
            return Err(RadiusClientError::InvalidConfig(
                "revive_interval must be > 0".into(),
            ));
        }
        if self.response_window.is_zero() {
            return Err(RadiusClientError::InvalidConfig(
                "response_window must be > 0".into(),
            ));
        }
        self.timeout_retry.validate()?;
        for policy in self.retry.values() {
            policy.validate()?;
        }
        Ok(())
    }
}
