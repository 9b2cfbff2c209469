//! Hash-linked append-only log of learned pattern batches.
//!
//! Each block commits a batch of fingerprints. A block's hash is the
//! SHA-256 of `index || previous_hash || timestamp || canonical-JSON(patterns)`,
//! so peers in any language agree on the hash as long as they agree on the
//! canonical JSON form (see [`guardmesh_core::canonical`]). Consensus is
//! the longest-valid-chain rule; ties keep the local chain.

use chrono::Utc;
use guardmesh_core::canonical::{canonical_json, sha256_hex};
use guardmesh_core::Severity;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Hash of the deterministic genesis block, shared by every honest node.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Validator id recorded on the genesis block.
pub const GENESIS_VALIDATOR: &str = "system";

/// One fingerprint inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPattern {
    pub pattern: String,
    pub category: String,
    pub severity: Severity,
    /// Unix epoch milliseconds when the fingerprint was learned.
    pub ts: i64,
}

/// A hash-linked batch of fingerprints — the unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub patterns: Vec<BlockPattern>,
    pub previous_hash: String,
    pub hash: String,
    pub validator_id: String,
}

impl Block {
    /// The deterministic genesis block. Identical across all honest nodes:
    /// fixed index, fixed timestamp, fixed hash, no patterns.
    pub fn genesis() -> Self {
        Self {
            index: 0,
            timestamp: 0,
            patterns: Vec::new(),
            previous_hash: "0".to_string(),
            hash: GENESIS_HASH.to_string(),
            validator_id: GENESIS_VALIDATOR.to_string(),
        }
    }
}

/// Canonical JSON [`Value`] for a pattern batch. Built by hand so that
/// hashing never depends on struct field order.
fn patterns_value(patterns: &[BlockPattern]) -> Value {
    Value::Array(
        patterns
            .iter()
            .map(|p| {
                json!({
                    "pattern": p.pattern,
                    "category": p.category,
                    "severity": p.severity.as_str(),
                    "ts": p.ts,
                })
            })
            .collect(),
    )
}

/// Compute a block hash from its contents.
pub fn block_hash(index: u64, previous_hash: &str, timestamp: i64, patterns: &[BlockPattern]) -> String {
    let canon = canonical_json(&patterns_value(patterns));
    let mut material = Vec::with_capacity(canon.len() + previous_hash.len() + 32);
    material.extend_from_slice(index.to_string().as_bytes());
    material.extend_from_slice(previous_hash.as_bytes());
    material.extend_from_slice(timestamp.to_string().as_bytes());
    material.extend_from_slice(&canon);
    sha256_hex(&material)
}

/// The local replication log. Single-writer: `add_block` and `resolve`
/// must be called under the owner's lock.
pub struct ReplicationLog {
    chain: Vec<Block>,
    validator_id: String,
}

impl ReplicationLog {
    pub fn new(validator_id: &str) -> Self {
        Self {
            chain: vec![Block::genesis()],
            validator_id: validator_id.to_string(),
        }
    }

    pub fn latest(&self) -> &Block {
        self.chain.last().expect("chain always holds genesis")
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        false // the genesis block is always present
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Build the block that would extend `prev_hash` with `patterns`.
    /// Pure: nothing is appended.
    pub fn create_block(&self, patterns: Vec<BlockPattern>, prev_hash: &str) -> Block {
        let index = self.latest().index + 1;
        let timestamp = Utc::now().timestamp_millis();
        let hash = block_hash(index, prev_hash, timestamp, &patterns);
        Block {
            index,
            timestamp,
            patterns,
            previous_hash: prev_hash.to_string(),
            hash,
            validator_id: self.validator_id.clone(),
        }
    }

    /// Append `block` iff it extends the current tip and its hash
    /// recomputes correctly. A duplicate index is rejected, which is what
    /// terminates gossip flooding.
    pub fn add_block(&mut self, block: Block) -> bool {
        let tip = self.latest();
        if block.index != tip.index + 1 {
            debug!(
                got = block.index,
                want = tip.index + 1,
                "rejecting block: wrong index"
            );
            return false;
        }
        if block.previous_hash != tip.hash {
            debug!(index = block.index, "rejecting block: previous_hash mismatch");
            return false;
        }
        let expected = block_hash(
            block.index,
            &block.previous_hash,
            block.timestamp,
            &block.patterns,
        );
        if block.hash != expected {
            warn!(index = block.index, "rejecting block: hash does not recompute");
            return false;
        }
        info!(index = block.index, patterns = block.patterns.len(), "block appended");
        self.chain.push(block);
        true
    }

    /// Validate an entire foreign chain: canonical genesis, then per-block
    /// link and hash checks on every prefix.
    pub fn validate_chain(chain: &[Block]) -> bool {
        let Some(first) = chain.first() else {
            return false;
        };
        if *first != Block::genesis() {
            return false;
        }
        for window in chain.windows(2) {
            let (prev, block) = (&window[0], &window[1]);
            if block.index != prev.index + 1 {
                return false;
            }
            if block.previous_hash != prev.hash {
                return false;
            }
            let expected = block_hash(
                block.index,
                &block.previous_hash,
                block.timestamp,
                &block.patterns,
            );
            if block.hash != expected {
                return false;
            }
        }
        true
    }

    /// Longest-valid-chain rule: adopt the longest candidate strictly
    /// longer than the local chain. Returns whether the local chain was
    /// replaced. Ties keep the local chain.
    pub fn resolve(&mut self, candidates: Vec<Vec<Block>>) -> bool {
        let best = candidates
            .into_iter()
            .filter(|candidate| {
                candidate.len() > self.chain.len() && Self::validate_chain(candidate)
            })
            .max_by_key(Vec::len);

        match best {
            Some(candidate) => {
                info!(
                    old_len = self.chain.len(),
                    new_len = candidate.len(),
                    "replacing local chain with longer valid peer chain"
                );
                self.chain = candidate;
                true
            }
            None => false,
        }
    }
}
