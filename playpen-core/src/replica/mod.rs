//! Conflict-free replicated buffers.
//!
//! Each buffer kind is backed by a yrs `Doc` holding one shared text.
//! Local edits produce a [`ReplicaOp`] carrying the encoded yrs update;
//! remote ops are merged with `apply_update`, which is commutative and
//! idempotent, so every replica that has seen the same set of ops shows
//! the same text regardless of arrival order.
//!
//! ```text
//!  local patch ──▸ Replica::apply ──▸ ReplicaOp ──▸ network
//!                                                    │
//!  remote ReplicaOp ──▸ Replica::merge ◂─────────────┘
//!                            │
//!                            ▼
//!                     Replica::snapshot ──▸ buffer store
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

use crate::patch::TextPatch;
use crate::BufferKind;

const TEXT_NAME: &str = "source";

const SEED_NAMESPACE: Uuid = Uuid::from_u128(0x2b8e_51c7_04fa_4d19_9e63_c1a8_7f20_d4e5);

/// yrs client id that seeds `text`. Equal texts get equal ids, so the
/// seed items of two peers are the same items and merge to one copy.
fn seed_client_id(text: &str) -> u64 {
    let (hi, _) = Uuid::new_v5(&SEED_NAMESPACE, text.as_bytes()).as_u64_pair();
    // yjs peers only accept 53-bit client ids
    hi & ((1 << 53) - 1)
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Undecodable update: {0}")]
    Decode(String),

    #[error("Merge failed: {0}")]
    Merge(String),
}

/// An operation produced by one replica and merged by the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaOp {
    /// Replica instance that produced the op.
    pub origin: Uuid,
    /// Local version counter of `origin` after the op.
    pub version: u64,
    /// Encoded yrs update (v1).
    pub update: Vec<u8>,
}

/// What `merge` did with an incoming op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    /// Already seen (redelivery or our own echo); nothing changed.
    Duplicate,
}

/// Capability interface of a replicated text buffer.
pub trait Replica {
    /// Apply a local edit and return the op to broadcast.
    fn apply(&mut self, patch: &TextPatch) -> Result<ReplicaOp, ReplicaError>;

    /// Merge an op from another replica.
    fn merge(&mut self, op: &ReplicaOp) -> Result<MergeOutcome, ReplicaError>;

    /// Materialised text.
    fn snapshot(&self) -> String;
}

/// yrs-backed [`Replica`].
pub struct YrsReplica {
    id: Uuid,
    doc: Doc,
    text: TextRef,
    version: u64,
    /// Highest version merged per remote origin.
    seen: HashMap<Uuid, u64>,
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsReplica {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            id: Uuid::new_v4(),
            doc,
            text,
            version: 0,
            seen: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of local ops produced so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }

    /// Encoded state vector, sent to peers to request what we are missing.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything we hold that a peer with `remote_sv` has not seen.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Insert the initial `text` as if written by a client derived from
    /// the text itself, and return the op to broadcast.
    pub fn seed(&mut self, text: &str) -> Result<ReplicaOp, ReplicaError> {
        let seed_doc = Doc::with_options(Options {
            client_id: seed_client_id(text),
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let seed_text = seed_doc.get_or_insert_text(TEXT_NAME);
        let update = {
            let mut txn = seed_doc.transact_mut();
            seed_text.insert(&mut txn, 0, text);
            txn.encode_update_v1()
        };
        self.merge_update(&update)?;

        self.version += 1;
        Ok(ReplicaOp {
            origin: self.id,
            version: self.version,
            update,
        })
    }

    /// Merge a raw yrs update that did not come wrapped in a `ReplicaOp`
    /// (sync handshake diffs).
    pub fn merge_update(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Merge(e.to_string()))
    }
}

impl Replica for YrsReplica {
    fn apply(&mut self, patch: &TextPatch) -> Result<ReplicaOp, ReplicaError> {
        let mut txn = self.doc.transact_mut();
        patch.validate(&self.text.get_string(&txn))?;

        if patch.delete > 0 {
            self.text.remove_range(&mut txn, patch.index, patch.delete);
        }
        if !patch.insert.is_empty() {
            self.text.insert(&mut txn, patch.index, &patch.insert);
        }
        let update = txn.encode_update_v1();
        drop(txn);

        self.version += 1;
        Ok(ReplicaOp {
            origin: self.id,
            version: self.version,
            update,
        })
    }

    fn merge(&mut self, op: &ReplicaOp) -> Result<MergeOutcome, ReplicaError> {
        if op.origin == self.id {
            return Ok(MergeOutcome::Duplicate);
        }
        // Ops from one origin arrive in order, so anything at or below the
        // high-water mark is a redelivery.
        if self.seen.get(&op.origin).is_some_and(|&v| op.version <= v) {
            return Ok(MergeOutcome::Duplicate);
        }

        self.merge_update(&op.update)?;
        self.seen.insert(op.origin, op.version);
        Ok(MergeOutcome::Applied)
    }

    fn snapshot(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }
}

/// Owns exactly one replica per buffer kind.
///
/// The local edit path and the remote merge path are the only writers.
pub struct ReplicaManager {
    replicas: HashMap<BufferKind, YrsReplica>,
}

impl Default for ReplicaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaManager {
    pub fn new() -> Self {
        let replicas = BufferKind::ALL
            .iter()
            .map(|kind| (*kind, YrsReplica::new()))
            .collect();
        Self { replicas }
    }

    fn replica(&self, kind: BufferKind) -> &YrsReplica {
        &self.replicas[&kind]
    }

    fn replica_mut(&mut self, kind: BufferKind) -> &mut YrsReplica {
        self.replicas.entry(kind).or_default()
    }

    /// Apply a local edit. Returns `None` for a no-op patch.
    pub fn local_edit(
        &mut self,
        kind: BufferKind,
        patch: &TextPatch,
    ) -> Result<Option<ReplicaOp>, ReplicaError> {
        if patch.is_noop() {
            return Ok(None);
        }
        self.replica_mut(kind).apply(patch).map(Some)
    }

    /// Merge a remote op. Undecodable ops are logged and discarded
    /// without touching the replica.
    pub fn apply_remote(
        &mut self,
        kind: BufferKind,
        op: &ReplicaOp,
    ) -> Result<MergeOutcome, ReplicaError> {
        let result = self.replica_mut(kind).merge(op);
        if let Err(e) = &result {
            log::warn!(
                "Discarding op v{} from {} on {kind} buffer: {e}",
                op.version,
                op.origin
            );
        }
        result
    }

    pub fn current_text(&self, kind: BufferKind) -> String {
        self.replica(kind).snapshot()
    }

    /// Insert `text` if the replica holds nothing yet.
    pub fn seed_if_empty(
        &mut self,
        kind: BufferKind,
        text: &str,
    ) -> Result<Option<ReplicaOp>, ReplicaError> {
        if text.is_empty() || !self.replica(kind).is_empty() {
            return Ok(None);
        }
        self.replica_mut(kind).seed(text).map(Some)
    }

    pub fn state_vector(&self, kind: BufferKind) -> Vec<u8> {
        self.replica(kind).state_vector()
    }

    pub fn diff_since(&self, kind: BufferKind, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        self.replica(kind).diff_since(remote_sv)
    }

    pub fn apply_sync(&mut self, kind: BufferKind, update: &[u8]) -> Result<(), ReplicaError> {
        let result = self.replica_mut(kind).merge_update(update);
        if let Err(e) = &result {
            log::warn!("Discarding sync update on {kind} buffer: {e}");
        }
        result
    }

    /// Drop the replica for `kind` and start a fresh one.
    ///
    /// Called on session teardown; the fresh replica has a new identity so
    /// nothing from the old merge state carries over.
    pub fn discard(&mut self, kind: BufferKind) {
        self.replicas.insert(kind, YrsReplica::new());
    }

    pub fn replica_id(&self, kind: BufferKind) -> Uuid {
        self.replica(kind).id()
    }
}
