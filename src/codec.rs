//! Codec wrapper (C3). A stateful Opus encoder/decoder pair over fixed-length
//! PCM frames, one instance per session direction.

use opus::{Application, Bitrate, Channels};
use tracing::warn;

fn opus_channels(channels: u16) -> Channels {
    if channels >= 2 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

pub struct Codec {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    frame_samples: usize,
    channels: u16,
    max_packet_size: usize,
}

impl Codec {
    pub fn new(sample_rate: u32, channels: u16, frame_samples: usize, bitrate: i32) -> anyhow::Result<Self> {
        let mut encoder = opus::Encoder::new(sample_rate, opus_channels(channels), Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(bitrate))?;
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels))?;
        Ok(Codec {
            encoder,
            decoder,
            frame_samples,
            channels,
            max_packet_size: 400,
        })
    }

    fn expected_pcm_len(&self) -> usize {
        self.frame_samples * self.channels as usize * 2
    }

    /// Encodes one frame of 16-bit LE PCM bytes. Returns `None` (logged at
    /// warn) if the input length doesn't match the session configuration or
    /// the underlying codec call fails.
    pub fn encode(&mut self, pcm_bytes: &[u8]) -> Option<Vec<u8>> {
        if pcm_bytes.len() != self.expected_pcm_len() {
            warn!(
                expected = self.expected_pcm_len(),
                got = pcm_bytes.len(),
                "codec encode: frame length mismatch"
            );
            return None;
        }
        let samples = bytes_to_i16(pcm_bytes);
        let mut out = vec![0u8; self.max_packet_size];
        match self.encoder.encode(&samples, &mut out) {
            Ok(len) => {
                out.truncate(len);
                Some(out)
            }
            Err(e) => {
                warn!(error = %e, "opus encode failed");
                None
            }
        }
    }

    /// Decodes one Opus packet back to 16-bit LE PCM bytes.
    pub fn decode(&mut self, packet_bytes: &[u8]) -> Option<Vec<u8>> {
        let mut out = vec![0i16; self.frame_samples * self.channels as usize];
        match self.decoder.decode(packet_bytes, &mut out, false) {
            Ok(len) => Some(i16_to_bytes(&out[..len * self.channels as usize])),
            Err(e) => {
                warn!(error = %e, "opus decode failed");
                None
            }
        }
    }

    pub fn set_bitrate(&mut self, bitrate: i32) -> anyhow::Result<()> {
        self.encoder.set_bitrate(Bitrate::Bits(bitrate))?;
        Ok(())
    }
}

fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_rejects_wrong_length() {
        let mut codec = Codec::new(16_000, 1, 320, 16_000).unwrap();
        assert!(codec.encode(&[0u8; 10]).is_none());
    }

    #[test]
    fn round_trip_preserves_length() {
        let mut codec = Codec::new(16_000, 1, 320, 16_000).unwrap();
        let pcm = vec![0u8; 320 * 2];
        let packet = codec.encode(&pcm).expect("encode");
        let decoded = codec.decode(&packet).expect("decode");
        assert_eq!(decoded.len(), pcm.len());
    }

    #[test]
    fn set_bitrate_updates_encoder_in_place() {
        let mut codec = Codec::new(16_000, 1, 320, 16_000).unwrap();
        codec.set_bitrate(24_000).expect("set_bitrate");
        let pcm = vec![0u8; 320 * 2];
        assert!(codec.encode(&pcm).is_some());
    }
}
