//! Socket I/O, external to this crate, but a concrete `tokio`-backed
//! adapter ships alongside the trait rather than leaving the seam
//! unfulfilled.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// connect, nonblocking read/write, shutdown(RDWR), close.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&mut self) -> io::Result<()>;

    /// Resolves once the socket is readable, without consuming the data.
    async fn readable(&self) -> io::Result<()>;

    /// Resolves once the socket can accept more writes.
    async fn writable(&self) -> io::Result<()>;

    /// Non-blocking send. `Err(WouldBlock)` means the caller should await
    /// `writable()` and retry (the "short write" / partial path).
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Non-blocking receive of one datagram.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn shutdown(&mut self) -> io::Result<()>;

    /// REPLICATE mode transitions the socket to write-only after connect
    /// A default no-op; `UdpTransport` has no read-half to
    /// shed, so it is a marker only.
    fn make_write_only(&mut self) {}

    /// Whether this transport is connection-oriented (TCP/TLS-style) rather
    /// than datagram. Stream-mode submissions never arm the per-code retry
    /// schedule — they use `timeout_retry` like REPLICATE.
    /// `UdpTransport` is always datagram, hence the default `false`.
    fn is_stream(&self) -> bool {
        false
    }
}

/// Default production adapter: one connected UDP socket to the RADIUS server.
pub struct UdpTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            socket: None,
        }
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self) -> io::Result<()> {
        let socket = UdpSocket::bind(self.local_addr).await?;
        socket.connect(self.peer_addr).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn readable(&self) -> io::Result<()> {
        self.socket()?.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.socket()?.writable().await
    }

    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket()?.try_send(buf)
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket()?.try_recv(buf)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.socket.take();
        Ok(())
    }
}

/// An in-memory transport pair for exercising the Connection/Trunk state
/// machine without real sockets. Kept public (not `#[cfg(test)]`) so
/// integration tests under `tests/` can use it too.
pub mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Inner {
        /// Datagrams queued for the client to receive (i.e. server -> client).
        inbound: Mutex<VecDeque<Vec<u8>>>,
        /// Datagrams the client has sent (i.e. client -> server), visible to tests.
        outbound: Mutex<VecDeque<Vec<u8>>>,
        notify_readable: Notify,
        connect_fails: std::sync::atomic::AtomicBool,
        send_blocked: std::sync::atomic::AtomicBool,
        write_only: std::sync::atomic::AtomicBool,
    }

    /// Handle a test uses to push replies in and inspect sent bytes.
    #[derive(Clone, Default)]
    pub struct FakeWire(std::sync::Arc<Inner>);

    impl FakeWire {
        pub fn push_reply(&self, bytes: Vec<u8>) {
            self.0.inbound.lock().unwrap().push_back(bytes);
            self.0.notify_readable.notify_waiters();
        }

        pub fn take_sent(&self) -> Vec<Vec<u8>> {
            self.0.outbound.lock().unwrap().drain(..).collect()
        }

        pub fn fail_connect(&self) {
            self.0.connect_fails.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn set_send_blocked(&self, blocked: bool) {
            self.0.send_blocked.store(blocked, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn is_write_only(&self) -> bool {
            self.0.write_only.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    pub struct FakeTransport {
        wire: FakeWire,
        connected: bool,
        stream: bool,
    }

    impl FakeTransport {
        pub fn new(wire: FakeWire) -> Self {
            Self {
                wire,
                connected: false,
                stream: false,
            }
        }

        /// Builds a stream-mode (TCP-like) fake transport, for the `CLIENT
        /// over stream` retry-policy boundary case.
        pub fn new_stream(wire: FakeWire) -> Self {
            Self {
                wire,
                connected: false,
                stream: true,
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> io::Result<()> {
            if self.wire.0.connect_fails.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            self.connected = true;
            Ok(())
        }

        async fn readable(&self) -> io::Result<()> {
            loop {
                if !self.wire.0.inbound.lock().unwrap().is_empty() {
                    return Ok(());
                }
                self.wire.0.notify_readable.notified().await;
            }
        }

        async fn writable(&self) -> io::Result<()> {
            while self.wire.0.send_blocked.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            Ok(())
        }

        fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
            if self.wire.0.send_blocked.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "blocked"));
            }
            self.wire.0.outbound.lock().unwrap().push_back(buf.to_vec());
            Ok(buf.len())
        }

        fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.wire.0.inbound.lock().unwrap();
            match inbound.pop_front() {
                Some(datagram) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no data")),
            }
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            self.connected = false;
            Ok(())
        }

        fn is_stream(&self) -> bool {
            self.stream
        }

        fn make_write_only(&mut self) {
            self.wire.0.write_only.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }
}
