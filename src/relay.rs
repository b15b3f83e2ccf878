//! Media relay (C7). Server-side opaque UDP fanout hub: registers senders by
//! transport address and forwards datagrams to every other known peer.
//! Never parses or decrypts payloads.

use crate::media_transport::MediaSocket;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Mapping from a known transport address to its (currently unused for
/// forwarding scope — see SPEC_FULL.md / spec.md §9) per-client fanout set.
/// Forwarding is global fanout among all known peers, per the resolved open
/// question in spec.md §9.
#[derive(Default)]
pub struct PeerRegistry {
    clients: HashMap<SocketAddr, HashSet<SocketAddr>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry::default()
    }

    pub fn add_peer(&mut self, client: SocketAddr, peer: SocketAddr) {
        self.clients.entry(client).or_default().insert(peer);
    }

    pub fn remove_peer(&mut self, client: SocketAddr, peer: SocketAddr) {
        if let Some(set) = self.clients.get_mut(&client) {
            set.remove(&peer);
        }
    }

    pub fn remove_client(&mut self, client: SocketAddr) {
        self.clients.remove(&client);
    }

    fn ensure_known(&mut self, client: SocketAddr) -> bool {
        if self.clients.contains_key(&client) {
            false
        } else {
            self.clients.insert(client, HashSet::new());
            true
        }
    }

    fn other_peers(&self, source: SocketAddr) -> Vec<SocketAddr> {
        self.clients
            .keys()
            .filter(|&&addr| addr != source)
            .copied()
            .collect()
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.clients.keys().copied().collect()
    }
}

pub struct MediaRelay {
    socket: Arc<MediaSocket>,
    registry: Mutex<PeerRegistry>,
    forwarded: AtomicU64,
    failed: AtomicU64,
}

impl MediaRelay {
    pub fn new(socket: Arc<MediaSocket>) -> Self {
        MediaRelay {
            socket,
            registry: Mutex::new(PeerRegistry::new()),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let relay = Arc::clone(self);
        self.socket.start_receiving(move |data, source| {
            relay.handle_packet(&data, source);
        });
    }

    /// Registers `source` on first sight, then forwards verbatim to every
    /// other known peer. Never delivers back to `source`.
    pub fn handle_packet(&self, payload: &[u8], source: SocketAddr) {
        let targets = {
            let mut reg = self.registry.lock();
            if reg.ensure_known(source) {
                info!(%source, "new relay peer");
            }
            reg.other_peers(source)
        };

        for target in targets {
            if self.socket.send(payload, target) {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
            } else {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%target, "relay forward failed, continuing with remaining peers");
            }
        }
    }

    pub fn add_peer(&self, client: SocketAddr, peer: SocketAddr) {
        self.registry.lock().add_peer(client, peer);
    }

    pub fn remove_peer(&self, client: SocketAddr, peer: SocketAddr) {
        self.registry.lock().remove_peer(client, peer);
    }

    pub fn remove_client(&self, client: SocketAddr) {
        self.registry.lock().remove_client(client);
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        self.registry.lock().known_peers()
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.forwarded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    pub fn stop(&self) {
        self.socket.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn first_receipt_registers_peer_with_empty_fanout() {
        let mut reg = PeerRegistry::new();
        assert!(reg.ensure_known(addr(1)));
        assert!(!reg.ensure_known(addr(1)));
        assert_eq!(reg.known_peers(), vec![addr(1)]);
    }

    #[test]
    fn forwarding_never_targets_the_source() {
        let mut reg = PeerRegistry::new();
        reg.ensure_known(addr(1));
        reg.ensure_known(addr(2));
        reg.ensure_known(addr(3));
        let targets = reg.other_peers(addr(1));
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&addr(1)));
    }

    #[test]
    fn remove_client_drops_it_from_registry() {
        let mut reg = PeerRegistry::new();
        reg.ensure_known(addr(1));
        reg.remove_client(addr(1));
        assert!(reg.known_peers().is_empty());
    }

    #[test]
    fn single_peer_relay_fanout_end_to_end() {
        let relay_socket = Arc::new(MediaSocket::bind("127.0.0.1:0").unwrap());
        let relay = Arc::new(MediaRelay::new(Arc::clone(&relay_socket)));
        relay.start();
        let relay_addr = relay_socket.local_addr().unwrap();

        let a = MediaSocket::bind("127.0.0.1:0").unwrap();
        let b = Arc::new(MediaSocket::bind("127.0.0.1:0").unwrap());
        let b_addr = b.local_addr().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        b.start_receiving(move |data, _| tx.send(data).unwrap());

        // Register both by having B send one datagram to the relay first.
        assert!(b.send(b"hello-from-b", relay_addr));
        std::thread::sleep(std::time::Duration::from_millis(100));
        let _ = rx.try_recv();

        for i in 0..10u32 {
            assert!(a.send(format!("pkt-{i}").as_bytes(), relay_addr));
        }

        let mut received = 0;
        while received < 10 {
            match rx.recv_timeout(std::time::Duration::from_secs(2)) {
                Ok(_) => received += 1,
                Err(_) => break,
            }
        }
        assert_eq!(received, 10);

        let (forwarded, _) = relay.stats();
        assert!(forwarded >= 10);

        relay.stop();
        drop(b);
        let _ = b_addr;
    }
}
