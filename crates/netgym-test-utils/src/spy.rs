//! Scripted [`Transport`] that records what the bridge sends.

use std::collections::VecDeque;
use std::time::Duration;

use netgym_bridge::framing;
use netgym_bridge::protocol::{Reply, Request};
use netgym_bridge::transport::{Transport, TransportError};

/// Transport double: replies come from a script, sends are recorded.
///
/// An exhausted script behaves like a silent simulator and returns
/// [`TransportError::Timeout`]. A scripted [`TransportError::ChannelClosed`]
/// closes the spy for good.
#[derive(Debug, Default)]
pub struct SpyTransport {
    script: VecDeque<Result<Reply, TransportError>>,
    sent: Vec<Vec<u8>>,
    receives: usize,
    closed: bool,
}

impl SpyTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spy that answers with `replies` in order.
    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        let mut spy = Self::new();
        spy.script.extend(replies.into_iter().map(Ok));
        spy
    }

    pub fn push_reply(&mut self, reply: Reply) {
        self.script.push_back(Ok(reply));
    }

    pub fn push_error(&mut self, err: TransportError) {
        self.script.push_back(Err(err));
    }

    /// Raw frames passed to `send`, in order.
    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Sent frames decoded back into requests.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent
            .iter()
            .map(|frame| framing::decode(frame).expect("spy recorded an undecodable frame"))
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.len()
    }

    pub const fn receive_count(&self) -> usize {
        self.receives
    }

    /// Scripted replies not consumed yet.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Transport for SpyTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Reply, TransportError> {
        self.receives += 1;
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        match self.script.pop_front() {
            Some(Err(TransportError::ChannelClosed)) => {
                self.closed = true;
                Err(TransportError::ChannelClosed)
            }
            Some(scripted) => scripted,
            None => Err(TransportError::Timeout(timeout)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::decision_reply;

    #[test]
    fn replays_script_then_times_out() {
        let mut spy = SpyTransport::with_replies([decision_reply(1, 0, 1, 1, false)]);
        assert!(spy.receive(Duration::from_millis(5)).is_ok());
        assert!(spy.receive(Duration::from_millis(5)).unwrap_err().is_timeout());
        assert_eq!(spy.receive_count(), 2);
    }

    #[test]
    fn records_sends() {
        let mut spy = SpyTransport::new();
        spy.send(&framing::encode(&Request::Shutdown).unwrap()).unwrap();
        assert_eq!(spy.sent_requests(), vec![Request::Shutdown]);
    }

    #[test]
    fn scripted_close_is_sticky() {
        let mut spy = SpyTransport::new();
        spy.push_error(TransportError::ChannelClosed);
        spy.push_reply(decision_reply(1, 0, 1, 1, false));
        assert!(matches!(spy.receive(Duration::ZERO), Err(TransportError::ChannelClosed)));
        assert!(spy.is_closed());
        assert!(matches!(spy.receive(Duration::ZERO), Err(TransportError::ChannelClosed)));
        assert!(matches!(spy.send(b"x"), Err(TransportError::ChannelClosed)));
        assert_eq!(spy.remaining(), 1);
    }
}
