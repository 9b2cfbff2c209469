//! Fleet immunity loop for Guardmesh.
//!
//! When the validation pipeline blocks a payload, this crate decides
//! whether the block is worth learning from ([`trigger`]), distils it into
//! a stored fingerprint ([`learn`]), batches fingerprints into hash-linked
//! blocks ([`ledger`]), and floods those blocks to peer nodes ([`gossip`])
//! so the whole fleet shares immunity. [`discovery`] red-teams the model
//! for novel payloads in the background, and [`killswitch`] quiesces the
//! sandbox behind critical detections.
//!
//! Components communicate over typed channels carrying [`FleetEvent`] —
//! message kinds are enumerated at the type level rather than dispatched
//! by string name.

pub mod discovery;
pub mod gossip;
pub mod killswitch;
pub mod learn;
pub mod ledger;
pub mod trigger;

use guardmesh_core::{AttackRecord, Severity, TriggerVerdict};
use ledger::Block;

/// Events broadcast between fleet components.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// The trigger bus accepted an attack record for learning.
    PatternDetected {
        record: AttackRecord,
        verdict: TriggerVerdict,
    },
    /// The learning service committed a new fingerprint to the store.
    PatternLearned {
        category: String,
        pattern: String,
        severity: Severity,
    },
    /// A block was appended to the local replication log.
    BlockAdded(Block),
    /// The local chain was replaced by a longer valid peer chain.
    ChainReplaced { length: usize },
}
