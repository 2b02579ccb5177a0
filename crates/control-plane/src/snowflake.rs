//! Snowflake ID generation.
//!
//! 64-bit sortable identifiers with the layout
//! `[41 bits ms timestamp | 10 bits node | 12 bits sequence]` and a custom
//! epoch of 2024-01-01T00:00:00Z. Event IDs within an execution are strictly
//! increasing because the timestamp occupies the high bits and the sequence
//! breaks ties within a millisecond.

use std::sync::{Arc, Mutex};

use chrono::Utc;

/// Milliseconds between the Unix epoch and 2024-01-01T00:00:00Z.
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u8 = 10;
const SEQ_BITS: u8 = 12;

const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQ: u16 = (1 << SEQ_BITS) - 1;

/// Thread-safe Snowflake ID generator.
///
/// Cheap to clone; clones share the same (last_ms, sequence) state so a
/// single process never hands out duplicate IDs.
#[derive(Clone)]
pub struct SnowflakeGenerator {
    node_id: u16,
    state: Arc<Mutex<GeneratorState>>,
}

struct GeneratorState {
    last_ms: i64,
    sequence: u16,
}

impl SnowflakeGenerator {
    /// Create a new generator for the given node id (truncated to 10 bits).
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: node_id & MAX_NODE,
            state: Arc::new(Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            })),
        }
    }

    /// Generate the next ID.
    ///
    /// When the 12-bit sequence rolls over inside one millisecond, the
    /// generator spins until the clock advances.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut now = current_ms();
        if now < state.last_ms {
            // Clock went backwards; hold the line at the last timestamp.
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = state.sequence.wrapping_add(1) & MAX_SEQ;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    now = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        ((now - EPOCH_MS) << (NODE_BITS + SEQ_BITS))
            | ((self.node_id as i64) << SEQ_BITS)
            | state.sequence as i64
    }

    /// Extract the millisecond timestamp (Unix epoch) encoded in an ID.
    pub fn timestamp_ms(id: i64) -> i64 {
        (id >> (NODE_BITS + SEQ_BITS)) + EPOCH_MS
    }
}

fn current_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let gen = SnowflakeGenerator::new(1);
        let mut prev = gen.next_id();
        for _ in 0..5000 {
            let next = gen.next_id();
            assert!(next > prev, "ids must be strictly increasing");
            prev = next;
        }
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let gen = SnowflakeGenerator::new(3);
        let before = Utc::now().timestamp_millis();
        let id = gen.next_id();
        let after = Utc::now().timestamp_millis();

        let ts = SnowflakeGenerator::timestamp_ms(id);
        assert!(ts >= before && ts <= after + 1);
    }

    #[test]
    fn test_node_id_truncated() {
        let gen = SnowflakeGenerator::new(u16::MAX);
        let id = gen.next_id();
        let node = (id >> SEQ_BITS) & MAX_NODE as i64;
        assert_eq!(node, MAX_NODE as i64);
    }

    #[test]
    fn test_clones_share_state() {
        let gen = SnowflakeGenerator::new(0);
        let clone = gen.clone();
        let a = gen.next_id();
        let b = clone.next_id();
        assert_ne!(a, b);
    }
}
