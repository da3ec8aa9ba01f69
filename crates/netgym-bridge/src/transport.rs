//! Duplex channel to one simulator instance.
//!
//! [`Transport`] is the seam the [`EpisodeStateMachine`] talks through;
//! [`TcpChannel`] is the production implementation. A transport moves whole
//! frames and decodes replies. It does not enforce the request/response
//! discipline, that is the caller's job.
//!
//! [`EpisodeStateMachine`]: crate::state_machine::EpisodeStateMachine

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::framing;
use crate::protocol::{CodecError, Reply};

const READ_CHUNK: usize = 64 * 1024;

/// Stand-in for a deadline that `Instant` cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 86_400);

/// `Instant::now() + timeout`, saturating instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Channel failures.
///
/// Only [`Timeout`](Self::Timeout) is recoverable; every other variant leaves
/// the channel unusable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid frame: {0}")]
    Frame(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Frame-level duplex channel.
pub trait Transport {
    /// Send one complete, already encoded frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Block until one complete reply has arrived or `timeout` elapses.
    fn receive(&mut self, timeout: Duration) -> Result<Reply, TransportError>;

    /// Close the channel. Idempotent.
    fn close(&mut self);

    /// Whether the channel has been closed, by either side.
    fn is_closed(&self) -> bool;
}

// ---------------------------------------------------------------------------
// TcpChannel
// ---------------------------------------------------------------------------

/// [`Transport`] over a TCP connection.
///
/// Bytes of a partially received frame are kept between calls, so a
/// [`Timeout`](TransportError::Timeout) in the middle of a frame loses
/// nothing: the next [`receive`](Transport::receive) completes it.
#[derive(Debug)]
pub struct TcpChannel {
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    inbuf: Vec<u8>,
    closed: bool,
}

impl TcpChannel {
    /// Connect to a simulator listening on `address`.
    pub fn open(address: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let connect_err = |source| TransportError::Connect {
            address: address.to_string(),
            source,
        };
        let mut last_err = None;
        for addr in address.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&addr, connect_timeout) {
                Ok(stream) => return Self::from_stream(stream).map_err(connect_err),
                Err(e) => last_err = Some(e),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
        })))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "simulator channel open");
        Ok(Self {
            stream: Arc::new(stream),
            peer,
            inbuf: Vec::new(),
            closed: false,
        })
    }

    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.inbuf.len()
    }

    /// Handle that can shut this channel down from another thread.
    pub fn canceller(&self) -> ChannelCanceller {
        ChannelCanceller {
            stream: Arc::clone(&self.stream),
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match framing::frame_len(&self.inbuf)? {
            Some(total) if self.inbuf.len() >= total => {
                let rest = self.inbuf.split_off(total);
                Ok(Some(std::mem::replace(&mut self.inbuf, rest)))
            }
            _ => Ok(None),
        }
    }

    fn fail(&mut self, err: std::io::Error) -> TransportError {
        self.closed = true;
        if is_disconnect(err.kind()) {
            debug!(peer = %self.peer, error = %err, "simulator channel lost");
            TransportError::ChannelClosed
        } else {
            TransportError::Io(err)
        }
    }
}

impl Transport for TcpChannel {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        let mut stream = &*self.stream;
        if let Err(e) = stream.write_all(frame).and_then(|()| stream.flush()) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Reply, TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        let deadline = deadline_after(timeout);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(framing::decode(&frame)?);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }
            if let Err(e) = self.stream.set_read_timeout(Some(remaining)) {
                return Err(self.fail(e));
            }

            let mut stream = &*self.stream;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    debug!(peer = %self.peer, pending = self.inbuf.len(), "simulator closed the channel");
                    return Err(TransportError::ChannelClosed);
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone; shutdown errors carry no news.
            let _ = self.stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "simulator channel closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

// ---------------------------------------------------------------------------
// ChannelCanceller
// ---------------------------------------------------------------------------

/// Shuts a [`TcpChannel`] down from any thread.
///
/// A `receive` blocked on the channel returns
/// [`ChannelClosed`](TransportError::ChannelClosed) shortly after.
#[derive(Debug, Clone)]
pub struct ChannelCanceller {
    stream: Arc<TcpStream>,
}

impl ChannelCanceller {
    pub fn cancel(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;
    use crate::protocol::Request;

    fn pair() -> (TcpChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let channel = TcpChannel::open(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (channel, server)
    }

    fn error_frame(message: &str) -> Vec<u8> {
        framing::encode(&Reply::Error {
            message: message.into(),
        })
        .unwrap()
    }

    #[test]
    fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpChannel::open(&addr.to_string(), Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    #[test]
    fn send_and_receive_whole_frames() {
        let (mut channel, mut server) = pair();
        let frame = framing::encode(&Request::Shutdown).unwrap();
        channel.send(&frame).unwrap();

        let req: Request = framing::read_message(&mut server).unwrap().unwrap();
        assert_eq!(req, Request::Shutdown);

        server.write_all(&error_frame("a")).unwrap();
        let reply = channel.receive(Duration::from_secs(2)).unwrap();
        assert!(matches!(reply, Reply::Error { message } if message == "a"));
    }

    #[test]
    fn two_frames_in_one_segment_are_split() {
        let (mut channel, mut server) = pair();
        let mut bytes = error_frame("first");
        bytes.extend(error_frame("second"));
        server.write_all(&bytes).unwrap();

        let first = channel.receive(Duration::from_secs(2)).unwrap();
        let second = channel.receive(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, Reply::Error { message } if message == "first"));
        assert!(matches!(second, Reply::Error { message } if message == "second"));
    }

    #[test]
    fn partial_frame_survives_timeout() {
        let (mut channel, mut server) = pair();
        let frame = error_frame("split");
        let (head, tail) = frame.split_at(6);

        server.write_all(head).unwrap();
        let err = channel.receive(Duration::from_millis(100)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(channel.buffered(), 6);
        assert!(!channel.is_closed());

        server.write_all(tail).unwrap();
        let reply = channel.receive(Duration::from_secs(2)).unwrap();
        assert!(matches!(reply, Reply::Error { message } if message == "split"));
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn peer_close_is_channel_closed_and_terminal() {
        let (mut channel, server) = pair();
        drop(server);
        let err = channel.receive(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
        assert!(channel.is_closed());

        let err = channel.send(&error_frame("late")).unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let (mut channel, mut server) = pair();
        server.write_all(&u32::MAX.to_le_bytes()).unwrap();
        let err = channel.receive(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Frame(CodecError::PayloadTooLarge { .. })));
    }

    #[test]
    fn garbage_payload_is_frame_error() {
        let (mut channel, mut server) = pair();
        let payload = b"{\"type\":\"warp\"}";
        let mut frame = u32::try_from(payload.len()).unwrap().to_le_bytes().to_vec();
        frame.extend_from_slice(payload);
        server.write_all(&frame).unwrap();
        let err = channel.receive(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Frame(CodecError::Json(_))));
    }

    #[test]
    fn canceller_unblocks_receive() {
        let (mut channel, _server) = pair();
        let canceller = channel.canceller();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = channel.receive(Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed | TransportError::Io(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let (mut channel, _server) = pair();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.receive(Duration::from_millis(10)),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test]
    fn deadline_after_saturates() {
        let now = Instant::now();
        assert!(deadline_after(Duration::MAX) > now);
        assert!(deadline_after(Duration::from_secs(u64::MAX / 2)) > now);
        let short = deadline_after(Duration::from_millis(5));
        assert!(short <= Instant::now() + Duration::from_millis(5));
    }
}
