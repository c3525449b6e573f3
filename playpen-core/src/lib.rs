//! # playpen-core: shared model for the Playpen live editor
//!
//! Holds the three source buffers (markup, styling, script), the
//! identifiers that bind a buffer to a replication channel, and the
//! conflict-free replica that each buffer kind is edited through.
//!
//! ## Modules
//!
//! - [`replica`]: `Replica` capability trait, yrs-backed replica, `ReplicaManager`
//! - [`patch`]: byte-range text patches and whole-buffer diffing
//! - [`share`]: one-shot snapshot encoding for share links
//! - [`defaults`]: starter content

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod defaults;
pub mod patch;
pub mod replica;
pub mod share;

pub use patch::TextPatch;
pub use replica::{MergeOutcome, Replica, ReplicaError, ReplicaManager, ReplicaOp, YrsReplica};
pub use share::ShareError;

/// The three linked source buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferKind {
    #[serde(rename = "html")]
    Markup,
    #[serde(rename = "css")]
    Style,
    #[serde(rename = "js")]
    Script,
}

impl BufferKind {
    pub const ALL: [BufferKind; 3] = [BufferKind::Markup, BufferKind::Style, BufferKind::Script];

    /// Short language tag, also used in channel addressing.
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferKind::Markup => "html",
            BufferKind::Style => "css",
            BufferKind::Script => "js",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current text of all three buffers.
///
/// This is the value the external buffer store hands to the sandbox and
/// the only state that is ever persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSet {
    pub html: String,
    pub css: String,
    pub js: String,
}

impl BufferSet {
    pub fn new(html: impl Into<String>, css: impl Into<String>, js: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            css: css.into(),
            js: js.into(),
        }
    }

    pub fn get(&self, kind: BufferKind) -> &str {
        match kind {
            BufferKind::Markup => &self.html,
            BufferKind::Style => &self.css,
            BufferKind::Script => &self.js,
        }
    }

    pub fn set(&mut self, kind: BufferKind, text: impl Into<String>) {
        let slot = match kind {
            BufferKind::Markup => &mut self.html,
            BufferKind::Style => &mut self.css,
            BufferKind::Script => &mut self.js,
        };
        *slot = text.into();
    }

    /// Restore the starter content.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new(defaults::HTML, defaults::CSS, defaults::JS)
    }
}

/// Namespace for deriving replication channel identifiers.
const CHANNEL_NAMESPACE: Uuid = Uuid::from_u128(0x6f3c_2a1e_9b4d_4e8f_a7c5_1d2e_3f40_5a6b);

/// Replication channel identifier for one (page, buffer kind) pair.
///
/// Derived deterministically so two participants on the same page and
/// buffer join the same channel, and different kinds never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn derive(page_id: &str, kind: BufferKind) -> Self {
        let name = format!("{page_id}-{}", kind.as_str());
        Self(Uuid::new_v5(&CHANNEL_NAMESPACE, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

/// Wraps a channel id received off the wire.
impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<DocumentId> for Uuid {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
