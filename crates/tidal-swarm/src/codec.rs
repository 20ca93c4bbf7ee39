use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SwarmError, SwarmResult};
use crate::message::{WireMessage, MAX_FRAME_SIZE};

/// Codec for swarm frames: `[4 bytes len BE][1 byte tag][bincode payload]`,
/// where `len` counts the tag and the payload.
pub struct WireCodec;

impl WireCodec {
    pub fn encode(msg: &WireMessage) -> SwarmResult<Vec<u8>> {
        let payload =
            bincode::serialize(msg).map_err(|e| SwarmError::Serialization(e.to_string()))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SwarmError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `data`. Returns (message,
    /// bytes_consumed).
    pub fn decode(data: &[u8]) -> SwarmResult<(WireMessage, usize)> {
        if data.len() < 5 {
            return Err(SwarmError::Framing("too short".into()));
        }
        let len = frame_len(&data[0..4])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(SwarmError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = decode_body(data[4], &data[5..total])?;
        Ok((msg, total))
    }

    pub async fn write<W>(writer: &mut W, msg: &WireMessage) -> SwarmResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = Self::encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream
    /// cleanly between frames.
    pub async fn read<R>(reader: &mut R) -> SwarmResult<Option<WireMessage>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = frame_len(&header)?;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        decode_body(body[0], &body[1..]).map(Some)
    }
}

fn frame_len(header: &[u8]) -> SwarmResult<usize> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(header);
    let len = u32::from_be_bytes(raw) as usize;
    if len < 1 {
        return Err(SwarmError::Framing("zero-length frame".into()));
    }
    if len - 1 > MAX_FRAME_SIZE {
        return Err(SwarmError::FrameTooLarge {
            size: len - 1,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

fn decode_body(tag: u8, payload: &[u8]) -> SwarmResult<WireMessage> {
    let msg: WireMessage =
        bincode::deserialize(payload).map_err(|e| SwarmError::Deserialization(e.to_string()))?;
    if msg.type_tag() != tag {
        return Err(SwarmError::InvalidMessageType(tag));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use tidal_core::{Log, LocalLog, MemoryStorage};
    use tidal_crypto::SigningKey;
    use tidal_types::CoreKey;

    async fn served_block() -> (LocalLog, tidal_core::BlockResponse) {
        let log = LocalLog::open(SigningKey::generate(), Arc::new(MemoryStorage::new())).unwrap();
        log.append_batch(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
            .await
            .unwrap();
        let response = log.serve(1).unwrap();
        (log, response)
    }

    #[tokio::test]
    async fn data_frame_survives_the_wire_and_still_verifies() {
        let (log, response) = served_block().await;
        let msg = WireMessage::Data { id: 7, response };
        let encoded = WireCodec::encode(&msg).unwrap();
        let (decoded, consumed) = WireCodec::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        match decoded {
            WireMessage::Data { id, response } => {
                assert_eq!(id, 7);
                assert_eq!(response.data, Bytes::from_static(b"two"));
                response.verify(log.key(), 1).unwrap();
            }
            other => panic!("decoded {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn stream_read_write() {
        let (log, _) = served_block().await;
        let (mut a, mut b) = tokio::io::duplex(1024);
        let dk = log.discovery_key();
        let sent = vec![
            WireMessage::Hello {
                version: 1,
                node: CoreKey::ephemeral(),
            },
            WireMessage::Open { discovery_key: dk },
            WireMessage::Have {
                discovery_key: dk,
                head: log.signed_head().unwrap(),
            },
            WireMessage::Close { discovery_key: dk },
        ];
        let writer = {
            let sent = sent.clone();
            tokio::spawn(async move {
                for msg in &sent {
                    WireCodec::write(&mut a, msg).await.unwrap();
                }
            })
        };
        for msg in &sent {
            let got = WireCodec::read(&mut b).await.unwrap().unwrap();
            assert_eq!(got.type_tag(), msg.type_tag());
        }
        writer.await.unwrap();
        assert!(WireCodec::read(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn type_tags_unique() {
        let dk = CoreKey::ephemeral().discovery_key();
        let msgs = [
            WireMessage::Hello {
                version: 1,
                node: CoreKey::ephemeral(),
            },
            WireMessage::Open { discovery_key: dk },
            WireMessage::Request {
                id: 0,
                discovery_key: dk,
                index: 0,
            },
            WireMessage::NoData {
                id: 0,
                reason: String::new(),
            },
            WireMessage::Close { discovery_key: dk },
        ];
        let mut tags: Vec<u8> = msgs.iter().map(|m| m.type_tag()).collect();
        let len = tags.len();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), len);
    }

    #[test]
    fn mismatched_tag_rejected() {
        let msg = WireMessage::NoData {
            id: 1,
            reason: "gone".into(),
        };
        let mut encoded = WireCodec::encode(&msg).unwrap();
        encoded[4] = 2;
        assert!(matches!(
            WireCodec::decode(&encoded),
            Err(SwarmError::InvalidMessageType(2))
        ));
    }

    #[test]
    fn decode_truncated() {
        let err = WireCodec::decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, SwarmError::Framing(_)));
    }

    #[test]
    fn decode_zero_length() {
        let err = WireCodec::decode(&[0u8, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, SwarmError::Framing(_)));
    }

    #[test]
    fn oversized_header_rejected_before_allocating() {
        let mut frame = (u32::MAX).to_be_bytes().to_vec();
        frame.push(1);
        assert!(matches!(
            WireCodec::decode(&frame),
            Err(SwarmError::FrameTooLarge { .. })
        ));
    }
}
