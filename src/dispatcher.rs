//! Public entry point.
//!
//! `submit()` plays the role of a coroutine-like yield: instead of a
//! callback record, the embedding engine gets back a future that resolves
//! to the result code, plus a [`PendingRequest`] handle carrying the
//! CANCEL/DUP signal methods.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::codec::{code, Attribute, ATTR_MESSAGE_AUTHENTICATOR};
use crate::config::{Config, Mode};
use crate::error::ResultCode;
use crate::ids::TrunkEntryId;
use crate::request::ProtocolRequest;
use crate::trunk::{Command, EnqueueOutcome, TrunkSnapshot};

/// What a caller hands the Dispatcher: everything about a ProtocolRequest
/// that the caller, rather than the trunk, decides.
pub struct SubmitRequest {
    pub code: u8,
    pub priority: u32,
    pub recv_time: Instant,
    pub attributes: Vec<Attribute>,
    /// Set when this is a proxied request with a compatible parent of the
    /// same code; drives the `timeout_retry`/no-active-retry
    /// path instead of `retry[code]`.
    pub has_compatible_parent: bool,
}

impl SubmitRequest {
    pub fn new(code: u8, priority: u32, recv_time: Instant) -> Self {
        Self {
            code,
            priority,
            recv_time,
            attributes: Vec::new(),
            has_compatible_parent: false,
        }
    }
}

/// Handle returned by [`Dispatcher::submit`]. Awaiting it resolves to the
/// mapped result code; `cancel()`/`signal_dup()` implement the signal-handling
/// rules for CANCEL and DUP.
pub struct PendingRequest {
    entry: TrunkEntryId,
    tx: mpsc::UnboundedSender<Command>,
    resume: oneshot::Receiver<ResultCode>,
}

impl PendingRequest {
    pub async fn wait(self) -> ResultCode {
        self.resume.await.unwrap_or(ResultCode::Fail)
    }

    /// CANCEL: cancel trunk entry, free ResultSlot.
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel(self.entry));
    }

    /// DUP: an upstream duplicate arrived; re-transmit on the same
    /// connection unless write-blocked.
    pub fn signal_dup(&self) {
        let _ = self.tx.send(Command::Dup(self.entry));
    }
}

/// The public entry point a worker exposes to its embedding engine.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(tx: mpsc::UnboundedSender<Command>, config: Arc<Config>) -> Self {
        Self { tx, config }
    }

    /// Introspection snapshot of the running trunk.
    /// `None` if the worker's event loop has already shut down.
    pub async fn snapshot(&self) -> Option<TrunkSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Command::Snapshot(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    /// `submit(request) -> yields; resume returns result_code`.
    ///
    /// Returns `ResultCode::Noop` synchronously for a caller-submitted
    /// Status-Server (reserved for the internal liveness probe), and
    /// `ResultCode::Fail` synchronously if the trunk has no capacity or the
    /// destination is unavailable, without ever enqueueing.
    pub async fn submit(&self, mut submitted: SubmitRequest) -> SubmitOutcome {
        if submitted.code == code::STATUS_SERVER {
            return SubmitOutcome::Resolved(ResultCode::Noop);
        }
        if !self.config.allowed_codes.is_empty() && !self.config.allowed_codes.contains(&submitted.code) {
            warn!(code = submitted.code, "outgoing code not in allowed_codes, rejecting");
            return SubmitOutcome::Resolved(ResultCode::Fail);
        }

        let mut request = ProtocolRequest::new(submitted.code, submitted.priority, submitted.recv_time);

        // If the caller's attributes already include Message-Authenticator,
        // require it on the reply and strip the caller's copy; the codec
        // re-adds it at encode time.
        if let Some(pos) = submitted
            .attributes
            .iter()
            .position(|a| a.kind == ATTR_MESSAGE_AUTHENTICATOR)
        {
            submitted.attributes.remove(pos);
            request.require_message_authenticator = true;
        }
        request.attributes = submitted.attributes;

        request.is_proxied = self.config.mode == Mode::Proxy && submitted.has_compatible_parent;

        let (resume_tx, resume_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Submit {
                request,
                resume: resume_tx,
                reply: reply_tx,
            })
            .is_err()
        {
            return SubmitOutcome::Resolved(ResultCode::Fail);
        }

        let (outcome, entry) = match reply_rx.await {
            Ok(v) => v,
            Err(_) => return SubmitOutcome::Resolved(ResultCode::Fail),
        };

        match outcome {
            EnqueueOutcome::NoCapacity | EnqueueOutcome::DstUnavailable | EnqueueOutcome::Fail => {
                warn!(?outcome, "submit rejected before dispatch");
                SubmitOutcome::Resolved(ResultCode::Fail)
            }
            EnqueueOutcome::Ok | EnqueueOutcome::InBacklog => {
                SubmitOutcome::Pending(PendingRequest {
                    entry,
                    tx: self.tx.clone(),
                    resume: resume_rx,
                })
            }
        }
    }
}

/// What [`Dispatcher::submit`] hands back: either an immediate result (the
/// caller-visible outcomes that never reach the trunk — NOOP, or a rejection that
/// never reached the trunk) or a handle to await/cancel/dup.
pub enum SubmitOutcome {
    Resolved(ResultCode),
    Pending(PendingRequest),
}

impl SubmitOutcome {
    /// Convenience for callers that don't need CANCEL/DUP: resolves
    /// immediately, or awaits the pending handle.
    pub async fn into_result(self) -> ResultCode {
        match self {
            SubmitOutcome::Resolved(code) => code,
            SubmitOutcome::Pending(pending) => pending.wait().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::NullCodec;
    use crate::transport::test_support::{FakeTransport, FakeWire};
    use crate::trunk::Trunk;

    fn config() -> Config {
        let mut c = Config::default();
        c.status_check_code = None;
        c.connections = 1;
        c
    }

    #[tokio::test]
    async fn status_server_is_rejected_with_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx, Arc::new(config()));
        let outcome = dispatcher
            .submit(SubmitRequest::new(code::STATUS_SERVER, 1, Instant::now()))
            .await;
        match outcome {
            SubmitOutcome::Resolved(ResultCode::Noop) => {}
            _ => panic!("expected immediate Noop"),
        }
    }

    #[tokio::test]
    async fn code_outside_allowed_list_is_rejected() {
        let mut cfg = config();
        cfg.allowed_codes = vec![code::ACCOUNTING_REQUEST];
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx, Arc::new(cfg));
        let outcome = dispatcher
            .submit(SubmitRequest::new(code::ACCESS_REQUEST, 1, Instant::now()))
            .await;
        match outcome {
            SubmitOutcome::Resolved(ResultCode::Fail) => {}
            _ => panic!("expected immediate Fail for a code outside allowed_codes"),
        }
    }

    #[tokio::test]
    async fn happy_path_submit_resumes_ok() {
        let cfg = Arc::new(config());
        let wire = FakeWire::default();
        let trunk = Trunk::new(
            (*cfg).clone(),
            Arc::new(NullCodec::default()),
            vec![FakeTransport::new(wire.clone())],
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx, cfg);
        tokio::spawn(trunk.run(rx));

        let outcome = dispatcher
            .submit(SubmitRequest::new(code::ACCESS_REQUEST, 10, Instant::now()))
            .await;
        let pending = match outcome {
            SubmitOutcome::Pending(p) => p,
            SubmitOutcome::Resolved(c) => panic!("expected pending, got {c:?}"),
        };

        // Give the trunk's event loop a moment to connect and drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let sent = wire.take_sent();
        assert_eq!(sent.len(), 1);
        let id = sent[0][crate::codec::ID_OFFSET];
        let mut reply = vec![0u8; crate::codec::HEADER_LEN];
        reply[0] = code::ACCESS_ACCEPT;
        reply[crate::codec::ID_OFFSET] = id;
        wire.push_reply(reply);

        assert_eq!(pending.wait().await, ResultCode::Ok);
    }

    #[tokio::test]
    async fn message_authenticator_in_attributes_sets_require_flag_and_is_stripped() {
        let mut submitted = SubmitRequest::new(code::ACCESS_REQUEST, 1, Instant::now());
        submitted.attributes.push(Attribute {
            kind: ATTR_MESSAGE_AUTHENTICATOR,
            value: vec![0; 16],
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(tx, Arc::new(config()));
        let _ = dispatcher.submit(submitted).await;
        match rx.recv().await {
            Some(Command::Submit { request, .. }) => {
                assert!(request.require_message_authenticator);
                assert!(!request
                    .attributes
                    .iter()
                    .any(|a| a.kind == ATTR_MESSAGE_AUTHENTICATOR));
            }
            _ => panic!("expected a Submit command"),
        }
    }
}
