//! Chunking extension for the interop (callback) channel.
//!
//! The raw Topic channel caps a command at the u16 length field; the
//! bridge channel layers ordered chunks on top so larger logical
//! messages can cross. Reassembly is bounded and aborts on any
//! sequencing anomaly instead of buffering unbounded data.

use std::collections::HashMap;

use uuid::Uuid;

use crate::ChunkError;

/// Default per-chunk payload size, well under the frame cap once the
/// chunk bookkeeping fields are added.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4096;
/// Default ceiling for a fully reassembled message.
pub const DEFAULT_MAX_ASSEMBLED_BYTES: usize = 2 * 1024 * 1024;

/// One slice of an oversized logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Correlates all chunks of one logical message.
    pub payload_id: Uuid,
    /// 0-based position within the set.
    pub sequence: u32,
    /// Total number of chunks in the set.
    pub total: u32,
    pub payload: String,
}

/// Split a payload into ordered chunks of at most `max_chunk_bytes`
/// each, split on char boundaries. A payload that fits in one chunk
/// still gets a single-element set.
pub fn split(payload: &str, max_chunk_bytes: usize) -> Vec<Chunk> {
    assert!(max_chunk_bytes > 0, "max_chunk_bytes must be positive");

    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in payload.chars() {
        if current.len() + c.len_utf8() > max_chunk_bytes {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    pieces.push(current);

    let payload_id = Uuid::new_v4();
    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, payload)| Chunk {
            payload_id,
            sequence: i as u32,
            total,
            payload,
        })
        .collect()
}

#[derive(Debug)]
struct PartialSet {
    total: u32,
    next_sequence: u32,
    buf: String,
}

/// Buffers in-flight chunk sets keyed by correlation id and yields the
/// reassembled message once the full count has arrived.
#[derive(Debug)]
pub struct ChunkAssembler {
    max_assembled_bytes: usize,
    sets: HashMap<Uuid, PartialSet>,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ASSEMBLED_BYTES)
    }
}

impl ChunkAssembler {
    pub fn new(max_assembled_bytes: usize) -> Self {
        Self {
            max_assembled_bytes,
            sets: HashMap::new(),
        }
    }

    /// Feed one chunk. Returns the complete payload when the set
    /// finishes, `None` while more chunks are expected. Any anomaly
    /// drops the whole set so a retry starts clean.
    pub fn feed(&mut self, chunk: Chunk) -> Result<Option<String>, ChunkError> {
        if chunk.total == 0 {
            return Err(ChunkError::ZeroTotal);
        }

        if !self.sets.contains_key(&chunk.payload_id) {
            if chunk.sequence != 0 {
                return Err(ChunkError::SequenceGap {
                    expected: 0,
                    got: chunk.sequence,
                });
            }
            self.sets.insert(
                chunk.payload_id,
                PartialSet {
                    total: chunk.total,
                    next_sequence: 0,
                    buf: String::new(),
                },
            );
        }
        let set = self
            .sets
            .get_mut(&chunk.payload_id)
            .expect("set present after insert");

        if chunk.total != set.total {
            let expected = set.total;
            self.sets.remove(&chunk.payload_id);
            return Err(ChunkError::TotalMismatch {
                expected,
                got: chunk.total,
            });
        }
        if chunk.sequence != set.next_sequence {
            let expected = set.next_sequence;
            self.sets.remove(&chunk.payload_id);
            return Err(ChunkError::SequenceGap {
                expected,
                got: chunk.sequence,
            });
        }
        if set.buf.len() + chunk.payload.len() > self.max_assembled_bytes {
            self.sets.remove(&chunk.payload_id);
            return Err(ChunkError::Oversize {
                limit: self.max_assembled_bytes,
            });
        }

        set.buf.push_str(&chunk.payload);
        set.next_sequence += 1;

        if set.next_sequence == set.total {
            let set = self
                .sets
                .remove(&chunk.payload_id)
                .expect("set present after feed");
            Ok(Some(set.buf))
        } else {
            Ok(None)
        }
    }

    /// Number of in-flight partial sets; the dispatcher drops idle
    /// connections, so this stays small.
    pub fn pending_sets(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_reassemble_exactly() {
        let payload = "abc".repeat(DEFAULT_MAX_CHUNK_BYTES); // 3 * max size
        let chunks = split(&payload, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.total == 3));

        let mut asm = ChunkAssembler::default();
        let mut result = None;
        for chunk in chunks {
            result = asm.feed(chunk).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
        assert_eq!(asm.pending_sets(), 0);
    }

    #[test]
    fn split_respects_char_boundaries() {
        let payload = "é".repeat(10);
        let chunks = split(&payload, 3);
        let rebuilt: String = chunks.iter().map(|c| c.payload.as_str()).collect();
        assert_eq!(rebuilt, payload);
        assert!(chunks.iter().all(|c| c.payload.len() <= 3));
    }

    #[test]
    fn sequence_gap_aborts_without_partial_delivery() {
        let chunks = split(&"z".repeat(10_000), 4096);
        assert!(chunks.len() >= 3);

        let mut asm = ChunkAssembler::default();
        assert!(asm.feed(chunks[0].clone()).unwrap().is_none());

        // Skip chunk 1 entirely.
        let err = asm.feed(chunks[2].clone()).unwrap_err();
        assert!(matches!(err, ChunkError::SequenceGap { expected: 1, got: 2 }));
        assert_eq!(asm.pending_sets(), 0);

        // Replaying from the gap does not resurrect the set.
        let err = asm.feed(chunks[1].clone()).unwrap_err();
        assert!(matches!(err, ChunkError::SequenceGap { expected: 0, .. }));
    }

    #[test]
    fn assembled_size_limit_enforced() {
        let chunks = split(&"q".repeat(300), 100);
        let mut asm = ChunkAssembler::new(250);

        let mut err = None;
        for chunk in chunks {
            match asm.feed(chunk) {
                Ok(_) => {}
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(err, Some(ChunkError::Oversize { limit: 250 })));
        assert_eq!(asm.pending_sets(), 0);
    }

    #[test]
    fn total_mismatch_aborts() {
        let mut chunks = split(&"w".repeat(10_000), 4096);
        let mut asm = ChunkAssembler::default();
        assert!(asm.feed(chunks[0].clone()).unwrap().is_none());

        chunks[1].total = 99;
        let err = asm.feed(chunks[1].clone()).unwrap_err();
        assert!(matches!(err, ChunkError::TotalMismatch { got: 99, .. }));
    }

    #[test]
    fn independent_sets_interleave() {
        let a = split("first message", 6);
        let b = split("second message", 6);
        let mut asm = ChunkAssembler::default();

        let mut done = Vec::new();
        for chunk in a.into_iter().zip(b).flat_map(|(x, y)| [x, y]) {
            if let Some(full) = asm.feed(chunk).unwrap() {
                done.push(full);
            }
        }
        assert!(done.contains(&"first message".to_string()));
        assert!(done.contains(&"second message".to_string()));
    }
}
