//! Signaling channel (C8) and router (C9). A reliable, newline-free,
//! length-bounded JSON protocol over TCP carrying call lifecycle events,
//! plus the server-side name registry and point-to-point forwarding.

use crate::error::VoipError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const RECV_BUFFER_SIZE: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const LISTEN_BACKLOG: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Register,
    Call,
    Accept,
    Reject,
    Hangup,
    #[serde(rename = "ice_candidate")]
    TransportHint,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub sender: String,
    pub recipient: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl SignalingMessage {
    pub fn new(kind: SignalType, sender: impl Into<String>) -> Self {
        SignalingMessage {
            kind,
            sender: sender.into(),
            recipient: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn register(sender: impl Into<String>) -> Self {
        Self::new(SignalType::Register, sender)
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn sender_is_valid(&self) -> bool {
        let len = self.sender.chars().count();
        (1..=64).contains(&len) && self.sender.chars().all(|c| !c.is_control())
    }

    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("signaling message always serializes")
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, VoipError> {
        serde_json::from_slice(bytes)
            .map_err(|e| VoipError::ProtocolFailure(format!("signaling parse: {e}")))
    }
}

type Callback = Box<dyn Fn(&SignalingMessage) + Send + Sync>;

#[derive(Default)]
struct CallbackTable {
    callbacks: HashMap<SignalType, Callback>,
}

impl CallbackTable {
    fn register(&mut self, kind: SignalType, cb: Callback) {
        self.callbacks.insert(kind, cb);
    }

    fn invoke(&self, msg: &SignalingMessage) {
        if let Some(cb) = self.callbacks.get(&msg.kind) {
            cb(msg);
        }
    }
}

/// Reads at most one JSON document per `recv` boundary, matching the
/// reference's 1024-byte chunked read. Returns `Ok(None)` on a read timeout
/// (no full message yet, caller should re-check its running flag).
fn read_one_message(stream: &mut TcpStream) -> Result<Option<SignalingMessage>, VoipError> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    match stream.read(&mut buf) {
        Ok(0) => Err(VoipError::ProtocolFailure("connection closed by peer".into())),
        Ok(n) => SignalingMessage::from_wire(&buf[..n]).map(Some),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(e) => Err(VoipError::TransportFailure(e.to_string())),
    }
}

/// Server-side name -> live-connection registry (C9's `NameRegistry`).
pub struct NameRegistry {
    connections: Mutex<HashMap<String, TcpStream>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Re-registration of an existing name replaces the prior binding.
    fn bind(&self, name: String, stream: TcpStream) {
        self.connections.lock().insert(name, stream);
    }

    fn unbind(&self, name: &str) {
        self.connections.lock().remove(name);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.connections.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    fn forward(&self, recipient: &str, message: &SignalingMessage) -> bool {
        let mut conns = self.connections.lock();
        match conns.get_mut(recipient) {
            Some(stream) => match stream.write_all(&message.to_wire()) {
                Ok(_) => true,
                Err(e) => {
                    warn!(%recipient, error = %e, "error forwarding message");
                    false
                }
            },
            None => false,
        }
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection state machine (C8), server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitingRegister,
    Registered,
}

pub struct SignalingServer {
    listener: TcpListener,
    registry: Arc<NameRegistry>,
    callbacks: Arc<Mutex<CallbackTable>>,
    running: Arc<AtomicBool>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingServer {
    pub fn bind(addr: &str) -> Result<Self, VoipError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| VoipError::TransportFailure(format!("bind {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| VoipError::TransportFailure(e.to_string()))?;
        info!(%addr, "signaling server bound");
        Ok(SignalingServer {
            listener,
            registry: Arc::new(NameRegistry::new()),
            callbacks: Arc::new(Mutex::new(CallbackTable::default())),
            running: Arc::new(AtomicBool::new(false)),
            accept_handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn register_callback<F>(&self, kind: SignalType, callback: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        self.callbacks.lock().register(kind, Box::new(callback));
    }

    pub fn registry(&self) -> &Arc<NameRegistry> {
        &self.registry
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .listener
            .try_clone()
            .expect("tcp listener clone failed");
        let registry = Arc::clone(&self.registry);
        let callbacks = Arc::clone(&self.callbacks);
        let running = Arc::clone(&self.running);

        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!(%addr, "signaling connection accepted");
                        let registry = Arc::clone(&registry);
                        let callbacks = Arc::clone(&callbacks);
                        let running = Arc::clone(&running);
                        thread::spawn(move || {
                            handle_connection(stream, registry, callbacks, running);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(POLL_TIMEOUT);
                    }
                    Err(e) => {
                        error!(error = %e, "error accepting connection");
                        thread::sleep(POLL_TIMEOUT);
                    }
                }
            }
        });
        *self.accept_handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    registry: Arc<NameRegistry>,
    callbacks: Arc<Mutex<CallbackTable>>,
    running: Arc<AtomicBool>,
) {
    if let Err(e) = stream.set_read_timeout(Some(POLL_TIMEOUT)) {
        warn!(error = %e, "failed to set read timeout on signaling connection");
    }

    let mut state = ConnState::AwaitingRegister;
    let mut bound_name: Option<String> = None;

    while running.load(Ordering::SeqCst) {
        let message = match read_one_message(&mut stream) {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "signaling connection closing");
                break;
            }
        };

        match state {
            ConnState::AwaitingRegister => {
                if message.kind != SignalType::Register {
                    warn!(sender = %message.sender, "first message was not REGISTER, closing");
                    break;
                }
                if !message.sender_is_valid() {
                    let err = VoipError::ProtocolFailure(format!(
                        "invalid sender name {:?}",
                        message.sender
                    ));
                    warn!(error = %err, "rejecting registration, closing connection");
                    break;
                }
                let name = message.sender.clone();
                let clone = match stream.try_clone() {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to clone signaling stream");
                        break;
                    }
                };
                registry.bind(name.clone(), clone);
                bound_name = Some(name.clone());
                state = ConnState::Registered;
                info!(name = %name, "signaling client registered");
            }
            ConnState::Registered => {
                callbacks.lock().invoke(&message);
                if let Some(recipient) = &message.recipient {
                    if !registry.forward(recipient, &message) {
                        debug!(recipient = %recipient, "recipient unknown, message dropped");
                    }
                }
            }
        }
    }

    if let Some(name) = bound_name {
        registry.unbind(&name);
        info!(name = %name, "signaling client disconnected");
    }
}

/// Client side of the signaling channel (C8).
pub struct SignalingClient {
    stream: Mutex<TcpStream>,
    callbacks: Arc<Mutex<CallbackTable>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn connect(addr: &str, name: &str) -> Result<Arc<Self>, VoipError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| VoipError::TransportFailure(format!("connect {addr}: {e}")))?;
        let register = SignalingMessage::register(name);
        {
            let mut s = &stream;
            s.write_all(&register.to_wire())
                .map_err(|e| VoipError::TransportFailure(e.to_string()))?;
        }
        stream
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(|e| VoipError::TransportFailure(e.to_string()))?;

        let client = Arc::new(SignalingClient {
            stream: Mutex::new(stream),
            callbacks: Arc::new(Mutex::new(CallbackTable::default())),
            running: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
        });
        client.start_receive_loop();
        info!(%name, "connected to signaling server");
        Ok(client)
    }

    fn start_receive_loop(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let mut recv_stream = me
            .stream
            .lock()
            .try_clone()
            .expect("tcp stream clone failed");
        let handle = thread::spawn(move || {
            while me.running.load(Ordering::SeqCst) {
                match read_one_message(&mut recv_stream) {
                    Ok(Some(msg)) => me.callbacks.lock().invoke(&msg),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(error = %e, "signaling client receive loop ending");
                        break;
                    }
                }
            }
            me.running.store(false, Ordering::SeqCst);
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn register_callback<F>(&self, kind: SignalType, callback: F)
    where
        F: Fn(&SignalingMessage) + Send + Sync + 'static,
    {
        self.callbacks.lock().register(kind, Box::new(callback));
    }

    pub fn send_message(&self, message: &SignalingMessage) -> bool {
        let mut stream = self.stream.lock();
        match stream.write_all(&message.to_wire()) {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "error sending signaling message");
                false
            }
        }
    }

    pub fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let _ = self.stream.lock().shutdown(std::net::Shutdown::Both);
        info!("disconnected from signaling server");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn sender_validation_rejects_empty_and_overlong_names() {
        let mut msg = SignalingMessage::register("");
        assert!(!msg.sender_is_valid());
        msg.sender = "a".repeat(64);
        assert!(msg.sender_is_valid());
        msg.sender = "a".repeat(65);
        assert!(!msg.sender_is_valid());
    }

    #[test]
    fn wire_round_trip_preserves_fields() {
        let mut data = serde_json::Map::new();
        data.insert("sdp".into(), serde_json::Value::String("v=0".into()));
        let msg = SignalingMessage::new(SignalType::Call, "bob")
            .with_recipient("alice")
            .with_data(data);
        let bytes = msg.to_wire();
        let parsed = SignalingMessage::from_wire(&bytes).unwrap();
        assert_eq!(parsed.kind, SignalType::Call);
        assert_eq!(parsed.sender, "bob");
        assert_eq!(parsed.recipient.as_deref(), Some("alice"));
    }

    #[test]
    fn transport_hint_serializes_as_ice_candidate_on_the_wire() {
        let msg = SignalingMessage::new(SignalType::TransportHint, "bob");
        let bytes = msg.to_wire();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"ice_candidate\""));
    }

    #[test]
    fn handshake_and_point_to_point_forward() {
        let server = SignalingServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap().to_string();
        server.start();

        let alice = SignalingClient::connect(&addr, "alice").unwrap();
        let (tx, rx) = mpsc::channel();
        alice.register_callback(SignalType::Call, move |m| {
            tx.send(m.clone()).unwrap();
        });

        thread::sleep(StdDuration::from_millis(150));

        let bob = SignalingClient::connect(&addr, "bob").unwrap();
        thread::sleep(StdDuration::from_millis(150));

        let call = SignalingMessage::new(SignalType::Call, "bob").with_recipient("alice");
        assert!(bob.send_message(&call));

        let received = rx
            .recv_timeout(StdDuration::from_secs(2))
            .expect("alice never received the CALL message");
        assert_eq!(received.sender, "bob");
        assert_eq!(received.recipient.as_deref(), Some("alice"));

        alice.disconnect();
        bob.disconnect();
        server.stop();
    }

    #[test]
    fn non_register_first_message_closes_connection() {
        let server = SignalingServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        server.start();

        let mut stream = TcpStream::connect(addr).unwrap();
        let bogus = SignalingMessage::new(SignalType::Call, "mallory").with_recipient("nobody");
        stream.write_all(&bogus.to_wire()).unwrap();

        thread::sleep(StdDuration::from_millis(200));
        assert!(!server.registry().is_bound("mallory"));
        server.stop();
    }

    #[test]
    fn register_with_invalid_sender_name_is_rejected() {
        let server = SignalingServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        server.start();

        let mut stream = TcpStream::connect(addr).unwrap();
        let bogus = SignalingMessage::register("");
        stream.write_all(&bogus.to_wire()).unwrap();

        thread::sleep(StdDuration::from_millis(200));
        assert!(!server.registry().is_bound(""));
        assert!(server.registry().names().is_empty());
        server.stop();
    }
}
