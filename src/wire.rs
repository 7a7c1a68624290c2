//! Wire format for cross-rank event batches.
//!
//! A batch is framed as:
//!
//! ```text
//! [count: u32][ for each entry: (class_id: i64, length: u32, bytes[length]) ]
//! ```
//!
//! All integers little-endian. `class_id == -1` denotes a null entry with
//! no length or bytes. Class id 0 is the engine [`Event`]; higher ids are
//! reserved for registered payload classes.

use thiserror::Error;

use crate::event::Event;

/// Class id of a null entry.
pub const CLASS_NULL: i64 = -1;
/// Class id of an engine event.
pub const CLASS_EVENT: i64 = 0;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("batch truncated at byte {0}")]
    Truncated(usize),

    #[error("unknown class id {0}")]
    UnknownClass(i64),

    #[error("entry failed to decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Encodes a batch of events for one destination rank.
pub fn encode_batch(events: &[Event]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(4 + events.len() * 64);
    out.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for ev in events {
        let bytes = serde_json::to_vec(ev)?;
        out.extend_from_slice(&CLASS_EVENT.to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

/// Decodes a batch produced by [`encode_batch`]. Null entries are
/// skipped.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Event>, WireError> {
    let mut pos = 0usize;
    let count = read_u32(data, &mut pos)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let class_id = read_i64(data, &mut pos)?;
        match class_id {
            CLASS_NULL => continue,
            CLASS_EVENT => {
                let len = read_u32(data, &mut pos)? as usize;
                let end = pos.checked_add(len).ok_or(WireError::Truncated(pos))?;
                if end > data.len() {
                    return Err(WireError::Truncated(pos));
                }
                let ev: Event = serde_json::from_slice(&data[pos..end])?;
                pos = end;
                out.push(ev);
            }
            other => return Err(WireError::UnknownClass(other)),
        }
    }
    Ok(out)
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, WireError> {
    let end = *pos + 4;
    if end > data.len() {
        return Err(WireError::Truncated(*pos));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*pos..end]);
    *pos = end;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64(data: &[u8], pos: &mut usize) -> Result<i64, WireError> {
    let end = *pos + 8;
    if end > data.len() {
        return Err(WireError::Truncated(*pos));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*pos..end]);
    *pos = end;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Payload};
    use crate::types::priority;

    fn event(seq: u64) -> Event {
        Event {
            deliver_time: 100 + seq,
            priority: priority::EVENT,
            order_tag: 5,
            queue_order: seq,
            dest_link: 3,
            id: EventId { serial: seq, rank: 1 },
            payload: Payload::Data(serde_json::json!({"n": seq})),
        }
    }

    #[test]
    fn test_round_trip() {
        let events: Vec<_> = (0..5).map(event).collect();
        let bytes = encode_batch(&events).unwrap();
        let back = decode_batch(&bytes).unwrap();
        assert_eq!(back.len(), 5);
        for (a, b) in events.iter().zip(&back) {
            assert_eq!(a.key(), b.key());
            assert_eq!(a.dest_link, b.dest_link);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_empty_batch() {
        let bytes = encode_batch(&[]).unwrap();
        assert_eq!(bytes.len(), 4);
        assert!(decode_batch(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_null_entries_skipped() {
        // Hand-build a batch with a null entry between two events.
        let ev = event(7);
        let ev_bytes = serde_json::to_vec(&ev).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&CLASS_NULL.to_le_bytes());
        data.extend_from_slice(&CLASS_EVENT.to_le_bytes());
        data.extend_from_slice(&(ev_bytes.len() as u32).to_le_bytes());
        data.extend_from_slice(&ev_bytes);

        let back = decode_batch(&data).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].key(), ev.key());
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let bytes = encode_batch(&[event(1)]).unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(decode_batch(cut), Err(WireError::Truncated(_))));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&42i64.to_le_bytes());
        assert!(matches!(
            decode_batch(&data),
            Err(WireError::UnknownClass(42))
        ));
    }
}
