//! Per-worker thread binding.
//!
//! One worker owns one `tokio` runtime thread, one [`Trunk`] (and its
//! connections), and exposes a [`Dispatcher`] handle to the embedding server.
//! There is no shared mutable state across workers: `spawn_worker` hands back
//! a clone-able `Dispatcher` backed by an `mpsc` channel into that thread's
//! event loop, with one such binding per worker thread.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::Codec;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::transport::Transport;
use crate::trunk::Trunk;

/// A running worker: the `Dispatcher` callers submit through, and the
/// `JoinHandle` of its dedicated event-loop task.
pub struct Worker {
    pub dispatcher: Dispatcher,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Spawns one `Trunk::run` task bound to the current `tokio` runtime and
/// returns a `Dispatcher` for it. Callers that want one worker per OS thread
/// should build one single-threaded `tokio::runtime::Runtime` per thread and
/// call this once inside each.
pub fn spawn_worker<T: Transport + 'static>(
    config: Config,
    codec: Arc<dyn Codec>,
    transports: Vec<T>,
) -> Worker {
    let config = Arc::new(config);
    let trunk = Trunk::new((*config).clone(), codec, transports);
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(tx, Arc::clone(&config));
    let handle = tokio::spawn(trunk.run(rx));
    Worker { dispatcher, handle }
}
