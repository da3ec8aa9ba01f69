//! In-process mock simulator: the scripted protocol server of
//! [`netgym_bridge::mock_sim`] on a loopback listener thread.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::warn;

pub use netgym_bridge::mock_sim::{Faults, MockConfig, MockCounters, SessionEnd, serve_connection};

// ---------------------------------------------------------------------------
// MockSimulator
// ---------------------------------------------------------------------------

/// Mock simulator listening on a loopback port, one connection at a time.
///
/// Attach a bridge with `BridgeConfig::attached(mock.address())`.
#[derive(Debug)]
pub struct MockSimulator {
    addr: SocketAddr,
    counters: Arc<MockCounters>,
    stop: Arc<AtomicBool>,
}

impl MockSimulator {
    pub fn start(config: MockConfig) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let counters = Arc::new(MockCounters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let (thread_counters, thread_stop) = (Arc::clone(&counters), Arc::clone(&stop));
        thread::spawn(move || {
            for stream in listener.incoming() {
                if thread_stop.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { continue };
                if let Err(e) = serve_connection(stream, &config, &thread_counters) {
                    warn!(error = %e, "mock simulator session failed");
                }
            }
        });

        Ok(Self { addr, counters, stop })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn counters(&self) -> &MockCounters {
        &self.counters
    }
}

impl Drop for MockSimulator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = TcpStream::connect(self.addr);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
