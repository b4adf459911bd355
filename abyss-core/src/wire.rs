//! Framing: length-prefix (4 bytes LE) + payload. Handshake frames carry bincode in the clear;
//! session frames carry a sealed (ChaCha20-Poly1305) bincode payload.

use crate::identity::{decrypt_wire, encrypt_wire, WireCryptoError};
use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serialize a message without framing.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(payload)
}

/// Deserialize a message without framing.
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Prefix `payload` with its length.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Length announced by a frame header, rejecting oversized frames before any allocation.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Encode a message into a single plaintext frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    frame(&encode_message(msg)?)
}

/// Decode one plaintext frame from the front of `bytes`. Returns the message and the number of
/// bytes consumed, or `NeedMore` if the buffer holds only part of a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_message(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Encode and encrypt a message with the next nonce of this direction. Returns the frame body
/// (without the length prefix).
pub fn seal_message(key: &[u8; 32], nonce: u64, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let plain = encode_message(msg)?;
    encrypt_wire(key, nonce, &plain).map_err(FrameEncodeError::Crypto)
}

/// Decrypt and decode a frame body produced by [`seal_message`].
pub fn open_message(key: &[u8; 32], nonce: u64, body: &[u8]) -> Result<Message, FrameDecodeError> {
    let plain = decrypt_wire(key, nonce, body).map_err(FrameDecodeError::Crypto)?;
    decode_message(&plain)
}

/// Error encoding a message into a frame (bincode, size limit, or encryption).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("seal error: {0}")]
    Crypto(WireCryptoError),
}

/// Error decoding a frame (need more bytes, too large, bincode or authentication failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("open error: {0}")]
    Crypto(WireCryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{EphemeralKey, Identity};
    use crate::objects::parse_append_payload;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::world::WorldId;

    fn sample_hello() -> Message {
        let id = Identity::generate();
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            public_key: id.public_key().clone(),
            ephemeral: *EphemeralKey::generate().public(),
        }
    }

    #[test]
    fn hello_frame_decodes() {
        let msg = sample_hello();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_hello()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_hello();
        let b = Message::JoinRequest {
            sender_session: WorldId::generate(),
            path: "/rooms/1".into(),
        };
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, _) = decode_frame(&buf[n1..]).unwrap();
        assert!(matches!(m1, Message::Hello { .. }));
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn sealed_messages_need_matching_key_and_nonce() {
        let key = [7u8; 32];
        let msg = Message::ObjectAppend {
            recver_session: WorldId::generate(),
            sender_session: WorldId::generate(),
            origin: Identity::generate().peer_id(),
            objects: parse_append_payload(r#"[{"id":"msg1","body":"hi"}]"#).unwrap(),
            hash: crate::objects::ObjectSet::new().hash(),
        };
        let body = seal_message(&key, 3, &msg).unwrap();
        assert_eq!(open_message(&key, 3, &body).unwrap(), msg);
        assert!(matches!(
            open_message(&key, 4, &body),
            Err(FrameDecodeError::Crypto(_))
        ));
        assert!(open_message(&[8u8; 32], 3, &body).is_err());
    }
}
