//! Media transport (C5). A bound UDP endpoint with a background receive
//! worker that fans out to a callback. Runs on its own OS thread per §5.

use crate::error::VoipError;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MAX_DATAGRAM_SIZE: usize = 65_535;
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(200);
const RECV_BACKOFF: Duration = Duration::from_millis(100);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct MediaSocket {
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MediaSocket {
    pub fn bind(addr: &str) -> Result<Self, VoipError> {
        let socket = UdpSocket::bind(addr)
            .map_err(|e| VoipError::TransportFailure(format!("bind {addr}: {e}")))?;
        socket
            .set_read_timeout(Some(RECV_POLL_TIMEOUT))
            .map_err(|e| VoipError::TransportFailure(format!("set_read_timeout: {e}")))?;
        info!(%addr, "media socket bound");
        Ok(MediaSocket {
            socket: Arc::new(socket),
            running: Arc::new(AtomicBool::new(false)),
            worker: parking_lot::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the background receive worker. `callback` is invoked
    /// synchronously for every datagram; it must not block for long since it
    /// runs on the receive thread.
    pub fn start_receiving<F>(&self, callback: F)
    where
        F: Fn(Vec<u8>, SocketAddr) + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let socket = Arc::clone(&self.socket);
        let running = Arc::clone(&self.running);

        let handle = thread::spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            while running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((n, addr)) => {
                        debug!(bytes = n, %addr, "media datagram received");
                        callback(buf[..n].to_vec(), addr);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        // Just a poll-interval timeout; re-check `running`.
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "media recv error, backing off");
                        thread::sleep(RECV_BACKOFF);
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Best-effort, non-blocking beyond the OS send buffer.
    pub fn send(&self, payload: &[u8], addr: SocketAddr) -> bool {
        match self.socket.send_to(payload, addr) {
            Ok(_) => true,
            Err(e) => {
                error!(%addr, error = %e, "media send failed");
                false
            }
        }
    }

    /// Halts the worker within ~1s and marks the socket stopped. The
    /// underlying `UdpSocket` is dropped with this struct.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MediaSocket {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn send_and_receive_round_trip() {
        let server = MediaSocket::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        server.start_receiving(move |data, addr| {
            tx.send((data, addr)).unwrap();
        });

        let client = MediaSocket::bind("127.0.0.1:0").unwrap();
        assert!(client.send(b"hello", server_addr));

        let (data, _addr) = rx.recv_timeout(Duration::from_secs(2)).expect("no datagram received");
        assert_eq!(data, b"hello");
        server.stop();
        client.stop();
    }

    #[test]
    fn stop_halts_worker_promptly() {
        let socket = MediaSocket::bind("127.0.0.1:0").unwrap();
        socket.start_receiving(|_, _| {});
        let start = std::time::Instant::now();
        socket.stop();
        assert!(start.elapsed() < STOP_JOIN_TIMEOUT + Duration::from_millis(500));
    }
}
