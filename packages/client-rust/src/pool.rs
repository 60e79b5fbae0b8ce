//! Per-node connection pool.
//!
//! A FIFO of idle TCP streams. Checkout probes the popped stream before
//! handing it out, because a pooled connection may have been closed by the
//! peer while idle; checkin pushes back unconditionally and leaves
//! validation to the next checkout.

use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Liveness probe
// ---------------------------------------------------------------------------

/// Outcome of probing an idle pooled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// The stream is idle and usable.
    Connected,
    /// The peer closed cleanly while the stream sat in the pool.
    RemoteClosed,
    /// The stream failed in a way that suggests the node restarted.
    BrokenUnexpected,
    /// The stream handle itself is invalid; a client-side bookkeeping bug.
    BadHandle,
}

/// Probes an idle stream without blocking.
pub trait ConnectionProbe: Send + Sync + 'static {
    fn probe(&self, stream: &TcpStream) -> ProbeState;
}

/// Default probe: a non-blocking read of the idle stream.
///
/// `WouldBlock` means the connection is quiet and healthy. A zero-length
/// read means the peer closed. Any buffered bytes on an idle connection are
/// protocol garbage, which gets the same treatment as a hard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TryReadProbe;

impl ConnectionProbe for TryReadProbe {
    fn probe(&self, stream: &TcpStream) -> ProbeState {
        let mut scratch = [0u8; 8];
        match stream.try_read(&mut scratch) {
            Ok(0) => ProbeState::RemoteClosed,
            Ok(_) => ProbeState::BrokenUnexpected,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ProbeState::Connected,
            Err(_) => ProbeState::BrokenUnexpected,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkout failures
// ---------------------------------------------------------------------------

/// Why a checkout produced no stream.
#[derive(Debug)]
pub enum CheckoutError {
    /// A pooled stream failed its probe unexpectedly. The caller should dun
    /// the node with the restart weight and surface a transient failure.
    RemoteBroken,
    /// Every dial attempt failed; carries the last I/O error, if any.
    Unreachable(Option<io::Error>),
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// FIFO pool of idle streams for one node.
pub struct ConnectionPool {
    idle: Mutex<VecDeque<TcpStream>>,
    probe: Box<dyn ConnectionProbe>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle.lock().len())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool with the default probe.
    pub fn new(connect_timeout: Duration) -> Self {
        Self::with_probe(connect_timeout, Box::new(TryReadProbe))
    }

    /// Creates an empty pool with a caller-supplied probe.
    pub fn with_probe(connect_timeout: Duration, probe: Box<dyn ConnectionProbe>) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            probe,
            connect_timeout,
        }
    }

    /// Number of idle streams currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Checks out a stream: pooled if one survives its probe, freshly
    /// dialed otherwise.
    ///
    /// Dialing tries each address in order and returns the first stream
    /// whose connect completes within the connect timeout.
    ///
    /// # Errors
    ///
    /// [`CheckoutError::RemoteBroken`] when a pooled stream fails
    /// unexpectedly; [`CheckoutError::Unreachable`] when no address could be
    /// dialed.
    pub async fn checkout(&self, addrs: &[SocketAddr]) -> Result<TcpStream, CheckoutError> {
        loop {
            let popped = self.idle.lock().pop_front();
            let Some(stream) = popped else { break };

            match self.probe.probe(&stream) {
                ProbeState::Connected => return Ok(stream),
                ProbeState::RemoteClosed => {
                    counter!("strata_client_conns_destroyed").increment(1);
                    debug!("pooled connection closed by peer, discarding");
                }
                ProbeState::BrokenUnexpected => {
                    counter!("strata_client_conns_destroyed").increment(1);
                    return Err(CheckoutError::RemoteBroken);
                }
                ProbeState::BadHandle => {
                    warn!("bad stream handle in pool, discarding");
                }
            }
        }

        let mut last_err = None;
        for addr in addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    counter!("strata_client_conns_created").increment(1);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "connect failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    debug!(%addr, "connect timed out");
                    last_err = Some(io::ErrorKind::TimedOut.into());
                }
            }
        }
        Err(CheckoutError::Unreachable(last_err))
    }

    /// Returns a stream to the pool. No validation; the next checkout
    /// probes it.
    pub fn checkin(&self, stream: TcpStream) {
        self.idle.lock().push_back(stream);
    }

    /// Drains the pool, shutting each stream down write-then-read before
    /// closing it.
    pub fn drain(&self) {
        let streams: Vec<TcpStream> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for stream in streams {
            counter!("strata_client_conns_destroyed").increment(1);
            if let Ok(std_stream) = stream.into_std() {
                let _ = std_stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Remaining streams close with the queue; drain() is for graceful
        // teardown paths.
        let count = self.idle.get_mut().len();
        if count > 0 {
            counter!("strata_client_conns_destroyed").increment(count as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn checkout_dials_when_pool_empty() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [addr];
        let (stream, accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn checkin_then_checkout_reuses_stream() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [addr];
        let (stream, _accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        let stream = stream.unwrap();
        let local = stream.local_addr().unwrap();

        pool.checkin(stream);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.checkout(&[addr]).await.unwrap();
        assert_eq!(reused.local_addr().unwrap(), local);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn closed_pooled_stream_is_discarded_and_redialed() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [addr];
        let (stream, accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        let stream = stream.unwrap();

        // Peer closes while the stream sits in the pool.
        drop(accepted.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.checkin(stream);

        let (redialed, reaccepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        assert!(redialed.is_ok());
        assert!(reaccepted.is_ok());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn unsolicited_data_is_broken_unexpected() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [addr];
        let (stream, accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        let stream = stream.unwrap();
        let (mut peer, _) = accepted.unwrap();

        peer.write_all(b"junk").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.checkin(stream);
        let err = pool.checkout(&addrs).await.unwrap_err();
        assert!(matches!(err, CheckoutError::RemoteBroken));
    }

    #[tokio::test]
    async fn unreachable_when_no_listener() {
        let pool = ConnectionPool::new(TIMEOUT);
        // Reserve a port, then free it so the dial is refused.
        let addr = {
            let (listener, addr) = listener().await;
            drop(listener);
            addr
        };
        let err = pool.checkout(&[addr]).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Unreachable(_)));
    }

    #[tokio::test]
    async fn dial_falls_through_dead_addresses() {
        let dead = {
            let (listener, addr) = listener().await;
            drop(listener);
            addr
        };
        let (listener, live) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [dead, live];
        let (stream, accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn drain_empties_pool() {
        let (listener, addr) = listener().await;
        let pool = ConnectionPool::new(TIMEOUT);

        let addrs = [addr];
        let (stream, _accepted) =
            tokio::join!(pool.checkout(&addrs), listener.accept());
        pool.checkin(stream.unwrap());
        assert_eq!(pool.idle_count(), 1);

        pool.drain();
        assert_eq!(pool.idle_count(), 0);
    }
}
