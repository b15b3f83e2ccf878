//! Session orchestrator (C10). Wires the audio adapter, framer, codec,
//! cipher, and jitter buffer together for one active call and drives the
//! independent send/receive loops described in spec.md §4.10.

use crate::audio::{AudioIo, CaptureHandle, PlaybackHandle};
use crate::codec::Codec;
use crate::config::Config;
use crate::crypto::{MediaCipher, SessionKey};
use crate::envelope::MediaEnvelope;
use crate::error::VoipError;
use crate::frame::Framer;
use crate::jitter::JitterBuffer;
use crate::media_transport::MediaSocket;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
}

pub struct Session {
    socket: Arc<MediaSocket>,
    peer: SocketAddr,
    running: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    frames_received: Arc<AtomicU64>,
    send_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    drain_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    jitter: Arc<JitterBuffer>,
    framer: Arc<parking_lot::Mutex<Framer>>,
}

impl Session {
    /// Starts both loops. `socket` is shared with the caller so a signaling
    /// layer or relay registration can reuse the same bound address.
    pub fn start(
        config: &Config,
        socket: Arc<MediaSocket>,
        peer: SocketAddr,
        key: &SessionKey,
        audio: &AudioIo,
        input_device: Option<&str>,
        output_device: Option<&str>,
    ) -> Result<Self, VoipError> {
        let capture = audio
            .open_capture(input_device, config.sample_rate, config.channels, config.frame_samples)
            .map_err(|e| {
                warn!(error = %e, "capture device unavailable, aborting session");
                e
            })?;
        let playback = audio
            .open_playback(output_device, config.sample_rate, config.channels, config.frame_samples)
            .map_err(|e| {
                warn!(error = %e, "playback device unavailable, aborting session");
                e
            })?;

        let send_cipher = Arc::new(MediaCipher::new(key));
        let recv_cipher = Arc::clone(&send_cipher);

        let send_codec = Codec::new(config.sample_rate, config.channels, config.frame_samples, config.bitrate)
            .map_err(|e| VoipError::CodecFailure(e.to_string()))?;
        let recv_codec = Arc::new(parking_lot::Mutex::new(
            Codec::new(config.sample_rate, config.channels, config.frame_samples, config.bitrate)
                .map_err(|e| VoipError::CodecFailure(e.to_string()))?,
        ));

        let jitter = Arc::new(JitterBuffer::new(&config.jitter));
        let running = Arc::new(AtomicBool::new(true));
        let frames_sent = Arc::new(AtomicU64::new(0));
        let frames_received = Arc::new(AtomicU64::new(0));
        let framer = Arc::new(parking_lot::Mutex::new(Framer::new(
            config.sample_rate,
            config.channels,
            config.frame_samples,
        )));

        let send_handle = spawn_send_loop(
            Arc::clone(&socket),
            peer,
            capture,
            send_codec,
            Arc::clone(&send_cipher),
            Arc::clone(&running),
            Arc::clone(&framer),
            Arc::clone(&frames_sent),
        );

        let drain_handle = spawn_receive_drain(Arc::clone(&jitter), playback, Arc::clone(&running));

        let jitter_for_recv = Arc::clone(&jitter);
        let frames_received_clone = Arc::clone(&frames_received);
        socket.start_receiving(move |data, from| {
            if from != peer {
                debug!(%from, %peer, "dropping datagram from unexpected source");
                return;
            }
            let mut codec = recv_codec.lock();
            handle_inbound_datagram(&data, &recv_cipher, &mut codec, &jitter_for_recv);
            frames_received_clone.fetch_add(1, Ordering::Relaxed);
        });

        Ok(Session {
            socket,
            peer,
            running,
            frames_sent,
            frames_received,
            send_handle: parking_lot::Mutex::new(Some(send_handle)),
            drain_handle: parking_lot::Mutex::new(Some(drain_handle)),
            jitter,
            framer,
        })
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }

    pub fn hangup(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.send_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.drain_handle.lock().take() {
            let _ = handle.join();
        }
        self.socket.stop();
        info!(
            peer = %self.peer,
            stats = ?self.stats(),
            framer_stats = ?self.framer.lock().stats(),
            "session stopped"
        );
        self.jitter.reset();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_send_loop(
    socket: Arc<MediaSocket>,
    peer: SocketAddr,
    capture: CaptureHandle,
    mut codec: Codec,
    cipher: Arc<MediaCipher>,
    running: Arc<AtomicBool>,
    framer: Arc<parking_lot::Mutex<Framer>>,
    frames_sent: Arc<AtomicU64>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            let Some(pcm) = capture.read_frame() else {
                break;
            };
            if !running.load(Ordering::SeqCst) {
                break;
            }
            let frame = {
                let mut framer = framer.lock();
                let frame = framer.create_frame(&pcm);
                if !framer.validate(&frame) {
                    warn!("captured frame failed validation, dropping");
                    continue;
                }
                frame
            };

            // Silence suppression is detected but not acted upon (spec.md §9):
            // frames are always transmitted regardless of `is_silence`.
            let Some(packet) = codec.encode(&frame.data) else {
                continue;
            };
            let Some((ciphertext, iv)) = cipher.encrypt(&packet) else {
                crate::crypto::log_cipher_failure("encrypting outbound media packet");
                continue;
            };
            let envelope = MediaEnvelope::new(frame.sequence, iv, ciphertext);
            if socket.send(&envelope.to_wire(), peer) {
                frames_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

fn spawn_receive_drain(
    jitter: Arc<JitterBuffer>,
    playback: PlaybackHandle,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match jitter.get_next_packet() {
                Some(pcm) => playback.write_frame(&pcm),
                None => thread::sleep(std::time::Duration::from_millis(5)),
            }
        }
    })
}

fn handle_inbound_datagram(
    data: &[u8],
    cipher: &MediaCipher,
    codec: &mut Codec,
    jitter: &JitterBuffer,
) {
    let envelope = match MediaEnvelope::from_wire(data) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "dropping malformed media envelope");
            return;
        }
    };
    let Some(packet) = cipher.decrypt(&envelope.ciphertext, &envelope.iv) else {
        crate::crypto::log_cipher_failure("decrypting inbound media packet");
        return;
    };
    let Some(pcm) = codec.decode(&packet) else {
        debug!("codec failure decoding media packet, dropping");
        return;
    };
    jitter.add_packet(envelope.sequence, pcm);
}
