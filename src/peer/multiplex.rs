//! Inner message multiplexing over an established session (§4.3.4, §6)
//!
//! Once a session is `established`, application data travels as outer DATA
//! messages whose payload is an [`InnerMessage`] — OPEN/CLOSE/DATA_CHUNK,
//! each carrying the tunnel-session id minted by the Front Plane.

use uuid::Uuid;

use crate::crypto::aead::{self, EncryptedData as AeadEncryptedData, KEY_LEN};
use crate::error::PeerError;
use crate::wire::peer::{data_payload, inner_message, DataPayload, EncryptedData, InnerMessage, InnerType};

/// Wraps an [`InnerMessage`] as a [`DataPayload`], sealing it when `key` is given (§4.3.4)
pub fn seal_inner(message: &InnerMessage, key: Option<&[u8; KEY_LEN]>) -> Result<DataPayload, PeerError> {
    use prost::Message;
    let mut plaintext = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut plaintext)
        .expect("Vec<u8> grows to fit any encoded length");

    match key {
        None => Ok(DataPayload {
            body: Some(data_payload::Body::Plaintext(plaintext)),
        }),
        Some(key) => {
            let sealed = aead::seal(key, &plaintext, &[])?;
            Ok(DataPayload {
                body: Some(data_payload::Body::Encrypted(EncryptedData {
                    nonce: sealed.nonce.to_vec(),
                    ciphertext: sealed.ciphertext,
                })),
            })
        }
    }
}

/// Unwraps a [`DataPayload`] back into its [`InnerMessage`]
pub fn open_inner(payload: &DataPayload, key: Option<&[u8; KEY_LEN]>) -> Result<InnerMessage, PeerError> {
    use prost::Message;
    let plaintext = match (&payload.body, key) {
        (Some(data_payload::Body::Plaintext(bytes)), _) => bytes.clone(),
        (Some(data_payload::Body::Encrypted(enc)), Some(key)) => {
            let mut nonce = [0u8; 12];
            if enc.nonce.len() != nonce.len() {
                return Err(PeerError::Decode {
                    reason: "invalid nonce length".to_string(),
                });
            }
            nonce.copy_from_slice(&enc.nonce);
            let data = AeadEncryptedData {
                nonce,
                ciphertext: enc.ciphertext.clone(),
            };
            aead::open(key, &data, &[])?
        }
        (Some(data_payload::Body::Encrypted(_)), None) => {
            return Err(PeerError::Decode {
                reason: "encrypted payload with no session key".to_string(),
            })
        }
        (None, _) => {
            return Err(PeerError::Decode {
                reason: "empty DATA payload".to_string(),
            })
        }
    };

    InnerMessage::decode(plaintext.as_slice()).map_err(|e| PeerError::Decode { reason: e.to_string() })
}

pub fn open_message(id: &str) -> InnerMessage {
    InnerMessage {
        r#type: InnerType::Open as i32,
        id: id.to_string(),
        payload: Vec::new(),
    }
}

pub fn close_message(id: &str) -> InnerMessage {
    InnerMessage {
        r#type: InnerType::Close as i32,
        id: id.to_string(),
        payload: Vec::new(),
    }
}

pub fn data_message(id: &str, payload: Vec<u8>) -> InnerMessage {
    InnerMessage {
        r#type: InnerType::DataChunk as i32,
        id: id.to_string(),
        payload,
    }
}

pub fn new_tunnel_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn is_open(message: &InnerMessage) -> bool {
    message.r#type == InnerType::Open as i32
}

pub fn is_close(message: &InnerMessage) -> bool {
    message.r#type == InnerType::Close as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_round_trip() {
        let id = new_tunnel_session_id();
        let message = data_message(&id, b"payload".to_vec());
        let sealed = seal_inner(&message, None).unwrap();
        let opened = open_inner(&sealed, None).unwrap();
        assert_eq!(opened.payload, b"payload");
        assert_eq!(opened.id, id);
    }

    #[test]
    fn encrypted_round_trip() {
        let key = [3u8; KEY_LEN];
        let id = new_tunnel_session_id();
        let message = open_message(&id);
        let sealed = seal_inner(&message, Some(&key)).unwrap();
        let opened = open_inner(&sealed, Some(&key)).unwrap();
        assert!(is_open(&opened));
        assert_eq!(opened.id, id);
    }

    #[test]
    fn encrypted_payload_without_key_fails() {
        let key = [3u8; KEY_LEN];
        let message = close_message("id");
        let sealed = seal_inner(&message, Some(&key)).unwrap();
        assert!(open_inner(&sealed, None).is_err());
    }
}
