//! MediaEnvelope wire format (§6): a UTF-8 JSON object with base64 fields.
//! This exact textual representation must be preserved for interoperability.

use crate::crypto::IV_LEN;
use crate::error::VoipError;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    encrypted: String,
    iv: String,
    sequence: u32,
}

/// The wire unit between peers.
#[derive(Debug, Clone)]
pub struct MediaEnvelope {
    pub sequence: u32,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl MediaEnvelope {
    pub fn new(sequence: u32, iv: [u8; IV_LEN], ciphertext: Vec<u8>) -> Self {
        MediaEnvelope {
            sequence,
            iv,
            ciphertext,
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let wire = WireEnvelope {
            encrypted: B64.encode(&self.ciphertext),
            iv: B64.encode(self.iv),
            sequence: self.sequence,
        };
        serde_json::to_vec(&wire).expect("envelope always serializes")
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, VoipError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| VoipError::ProtocolFailure(format!("envelope parse: {e}")))?;
        let ciphertext = B64
            .decode(wire.encrypted)
            .map_err(|e| VoipError::ProtocolFailure(format!("bad base64 ciphertext: {e}")))?;
        let iv_bytes = B64
            .decode(wire.iv)
            .map_err(|e| VoipError::ProtocolFailure(format!("bad base64 iv: {e}")))?;
        if iv_bytes.len() != IV_LEN {
            return Err(VoipError::ProtocolFailure(format!(
                "iv length {} != {IV_LEN}",
                iv_bytes.len()
            )));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&iv_bytes);
        Ok(MediaEnvelope {
            sequence: wire.sequence,
            iv,
            ciphertext,
        })
    }
}
