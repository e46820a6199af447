//! Document identifier codec.
//!
//! Every collaborative document is addressed by a structured key that is
//! flattened into an opaque string for storage and for the workspace
//! directory:
//!
//! ```text
//! ┌───────────────┬────────────┬──────────────┐
//! │ entity kind   │ entity id  │ doc kind     │
//! │ space|room|…  │ u64        │ description… │
//! └───────────────┴────────────┴──────────────┘
//!        "room:42:description"      "space_root"
//! ```
//!
//! The codec is a pure, total function over strings: anything that is not
//! one of the canonical forms decodes to `None`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved id of the space's own document inside its workspace.
pub const SPACE_ROOT_ID: &str = "space_root";

/// Kind of business entity a document is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Space,
    Room,
    Clue,
    /// Free-standing document not owned by a room or clue.
    Independent,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Space => "space",
            EntityKind::Room => "room",
            EntityKind::Clue => "clue",
            EntityKind::Independent => "independent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "space" => Some(EntityKind::Space),
            "room" => Some(EntityKind::Room),
            "clue" => Some(EntityKind::Clue),
            "independent" => Some(EntityKind::Independent),
            _ => None,
        }
    }
}

/// Which document of an entity is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocKind {
    Description,
    Readme,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Description => "description",
            DocKind::Readme => "readme",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "description" => Some(DocKind::Description),
            "readme" => Some(DocKind::Readme),
            _ => None,
        }
    }
}

/// Structured document key. Also used as the remote service key
/// `(entityType, entityId, docType)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId {
    pub entity_kind: EntityKind,
    pub entity_id: u64,
    pub doc_kind: DocKind,
}

impl DocumentId {
    pub fn new(entity_kind: EntityKind, entity_id: u64, doc_kind: DocKind) -> Self {
        Self {
            entity_kind,
            entity_id,
            doc_kind,
        }
    }

    pub fn room_description(room_id: u64) -> Self {
        Self::new(EntityKind::Room, room_id, DocKind::Description)
    }

    pub fn clue_description(clue_id: u64) -> Self {
        Self::new(EntityKind::Clue, clue_id, DocKind::Description)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.entity_kind.as_str(),
            self.entity_id,
            self.doc_kind.as_str()
        )
    }
}

/// Anything that can live inside a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentDescriptor {
    /// The space's own document (singleton per workspace).
    SpaceRoot,
    Entity(DocumentId),
}

impl DocumentDescriptor {
    /// Canonical string form.
    pub fn encode(&self) -> String {
        encode(self)
    }

    /// Key on the remote document service, if this document has one.
    ///
    /// The space root borrows the workspace's numeric space id; a
    /// workspace without one has no remote counterpart for its root.
    pub fn remote_key(&self, workspace: &WorkspaceId) -> Option<DocumentId> {
        match self {
            DocumentDescriptor::SpaceRoot => workspace
                .space_id()
                .map(|id| DocumentId::new(EntityKind::Space, id, DocKind::Description)),
            DocumentDescriptor::Entity(id) => Some(*id),
        }
    }
}

impl From<DocumentId> for DocumentDescriptor {
    fn from(id: DocumentId) -> Self {
        DocumentDescriptor::Entity(id)
    }
}

impl fmt::Display for DocumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentDescriptor::SpaceRoot => f.write_str(SPACE_ROOT_ID),
            DocumentDescriptor::Entity(id) => id.fmt(f),
        }
    }
}

/// Encode a descriptor into its canonical string id.
pub fn encode(descriptor: &DocumentDescriptor) -> String {
    descriptor.to_string()
}

/// Decode a string id. Returns `None` for anything that is not a supported
/// canonical form, including legacy ids without a numeric entity id.
pub fn decode(id: &str) -> Option<DocumentDescriptor> {
    if id == SPACE_ROOT_ID {
        return Some(DocumentDescriptor::SpaceRoot);
    }

    let mut parts = id.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(entity_id), Some(doc_kind), None) => {
            let entity_kind = EntityKind::parse(kind)?;
            let entity_id = parse_entity_id(entity_id)?;
            let doc_kind = DocKind::parse(doc_kind)?;
            Some(DocumentDescriptor::Entity(DocumentId::new(
                entity_kind,
                entity_id,
                doc_kind,
            )))
        }
        (Some(legacy), None, None, None) => decode_legacy(legacy),
        _ => None,
    }
}

/// Legacy `<kind>_<id>` ids always referred to the description document.
fn decode_legacy(id: &str) -> Option<DocumentDescriptor> {
    let (kind, entity_id) = id.split_once('_')?;
    let entity_kind = EntityKind::parse(kind)?;
    let entity_id = parse_entity_id(entity_id)?;
    Some(DocumentDescriptor::Entity(DocumentId::new(
        entity_kind,
        entity_id,
        DocKind::Description,
    )))
}

/// Strict decimal: no sign, no whitespace, no leading zeros.
fn parse_entity_id(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// One workspace per space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Workspace of a numeric space.
    pub fn space(space_id: u64) -> Self {
        Self(format!("space:{space_id}"))
    }

    /// Numeric space id, when this workspace was built from one.
    pub fn space_id(&self) -> Option<u64> {
        self.0.strip_prefix("space:").and_then(parse_entity_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
