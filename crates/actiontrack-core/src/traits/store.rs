//! Persistence collaborator.
//!
//! Writes go through [`WriteBatch`], applied atomically by
//! [`EntityStore::write`]. Two tiers of entity write exist:
//! [`Write::Save`] writes a record's attributes and is only issued by the
//! tracker's full-save path (the one that runs change classification),
//! while [`Write::Stamp`] touches the relationship bookkeeping columns and
//! nothing else. The two never overlap: a save of an existing record
//! leaves `relationship_updated_at/by` as stored, so a stamp committed
//! between a save's read and its write survives.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AuditEntry, Endpoint, Entity, EntityId, EntityKind, Link, LinkId, LinkKind, Stamp, User,
    UserId,
};

/// One operation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Insert an entity, or replace an existing one's attributes. The
    /// relationship stamp columns are only taken from the value on insert.
    Save(Entity),
    /// Insert or replace a user.
    SaveUser(User),
    /// Set `relationship_updated_at/by` only. A missing target is skipped.
    Stamp { target: Endpoint, stamp: Stamp },
    InsertLink(Link),
    /// Replace an existing link's endpoints.
    ReplaceLink(Link),
    RemoveLink(LinkId),
    /// Remove an entity and every link that references it.
    Destroy(EntityId),
    Audit {
        event: String,
        actor: Option<UserId>,
        subject: String,
        details: Option<String>,
        at: DateTime<Utc>,
    },
}

/// Ordered list of writes committed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn extend(&mut self, writes: impl IntoIterator<Item = Write>) -> &mut Self {
        self.writes.extend(writes);
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// What a committed batch did with its stamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Targets whose relationship stamp was written.
    pub stamped: Vec<Endpoint>,
    /// Targets that no longer existed when the stamp was applied.
    pub skipped: Vec<Endpoint>,
}

impl BatchOutcome {
    /// Entity ids among the stamped targets.
    pub fn stamped_entities(&self) -> Vec<EntityId> {
        self.stamped
            .iter()
            .filter_map(|e| match e {
                Endpoint::Entity(id) => Some(*id),
                Endpoint::User(_) => None,
            })
            .collect()
    }
}

/// Entity, user, link and audit storage.
pub trait EntityStore: Send + Sync {
    /// Allocate an id from the store-wide sequence.
    fn next_id(&self) -> Result<i64>;

    fn entity(&self, id: EntityId) -> Result<Option<Entity>>;

    fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    fn user(&self, id: UserId) -> Result<Option<User>>;

    fn link(&self, id: LinkId) -> Result<Option<Link>>;

    /// Every link with `endpoint` on either side.
    fn links_for(&self, endpoint: Endpoint) -> Result<Vec<Link>>;

    fn find_link(&self, kind: LinkKind, left: Endpoint, right: Endpoint) -> Result<Option<Link>>;

    /// Apply all writes or none.
    fn write(&self, batch: WriteBatch) -> Result<BatchOutcome>;

    /// Audit entries for a subject key, oldest first.
    fn audit_trail(&self, subject: &str) -> Result<Vec<AuditEntry>>;
}
