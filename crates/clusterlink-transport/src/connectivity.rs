//! Connectivity state of one client connection
//!
//! tonic channels do not expose connectivity, so the dialer reports it
//! instead: the connector marks each attempt as `Connecting`, and the
//! socket it hands to tonic is wrapped in a [`TrackedStream`] that reports
//! `Ready` on first inbound data and `TransientFailure` when the socket
//! fails, reaches EOF or is dropped. Closing the owning connection moves it
//! to `Shutdown`, which is terminal.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Lifecycle state of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No socket yet; the channel connects on first use
    Idle,
    /// A socket is being established
    Connecting,
    /// The socket is up and the peer has spoken
    Ready,
    /// The socket failed or closed; a reconnect may still succeed
    TransientFailure,
    /// The connection was closed locally and will not reconnect
    Shutdown,
}

impl ConnectivityState {
    /// Whether the state can never change again
    pub fn is_terminal(self) -> bool {
        self == ConnectivityState::Shutdown
    }
}

struct TrackerInner {
    state: watch::Sender<ConnectivityState>,
    attempt: AtomicU64,
}

/// Shared, observable connectivity state
///
/// Clones share the same state. Updates are tagged with the connect attempt
/// that produced them so a socket from an earlier attempt cannot overwrite
/// the state of a newer one.
#[derive(Clone)]
pub struct ConnectivityTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for ConnectivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityTracker")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for ConnectivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityTracker {
    /// New tracker in the `Idle` state
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectivityState::Idle);
        Self {
            inner: Arc::new(TrackerInner {
                state,
                attempt: AtomicU64::new(0),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Start a new connect attempt and mark the connection `Connecting`
    pub fn begin_attempt(&self) -> u64 {
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.transition(ConnectivityState::Connecting);
        attempt
    }

    /// Record `state` if `attempt` is still the latest connect attempt
    pub fn set_for(&self, attempt: u64, state: ConnectivityState) {
        if self.inner.attempt.load(Ordering::SeqCst) == attempt {
            self.transition(state);
        }
    }

    /// Record `state` unconditionally (unless already shut down)
    pub fn set(&self, state: ConnectivityState) {
        self.transition(state);
    }

    /// Move to `Shutdown`
    pub fn shutdown(&self) {
        self.transition(ConnectivityState::Shutdown);
    }

    fn transition(&self, next: ConnectivityState) {
        self.inner.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Socket wrapper reporting liveness to a [`ConnectivityTracker`]
///
/// Once `closed` is cancelled every read and write fails, which tears down
/// the HTTP/2 connection running on top regardless of who else still holds
/// the channel.
pub struct TrackedStream<S> {
    inner: S,
    tracker: ConnectivityTracker,
    attempt: u64,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    ready: bool,
    failed: bool,
}

impl<S> TrackedStream<S> {
    /// Wrap `inner` as the socket of connect attempt `attempt`
    pub fn new(
        inner: S,
        tracker: ConnectivityTracker,
        attempt: u64,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner,
            tracker,
            attempt,
            closed: Box::pin(closed.cancelled_owned()),
            ready: false,
            failed: false,
        }
    }

    fn fail(&mut self) {
        if !self.failed {
            self.failed = true;
            self.tracker
                .set_for(self.attempt, ConnectivityState::TransientFailure);
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.closed.as_mut().poll(cx).is_ready() {
            self.fail();
            return Some(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            ));
        }
        None
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }

        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if had_room && buf.filled().len() == before {
                    // EOF
                    this.fail();
                } else if !this.ready && !this.failed {
                    this.ready = true;
                    this.tracker
                        .set_for(this.attempt, ConnectivityState::Ready);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.fail();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.poll_closed(cx) {
            return Poll::Ready(Err(err));
        }
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(_)) = &result {
            this.fail();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        if let Poll::Ready(Err(_)) = &result {
            this.fail();
        }
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.fail();
    }
}
