//! In-memory entity store.
//! Batches are applied to a copy of the state and swapped in on success,
//! so a failing write leaves nothing behind.

use std::collections::BTreeMap;
use std::sync::Mutex;

use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::traits::{BatchOutcome, EntityStore, Write, WriteBatch};
use actiontrack_core::types::{
    AuditEntry, Endpoint, Entity, EntityId, EntityKind, Link, LinkId, LinkKind, User, UserId,
};

#[derive(Debug, Clone, Default)]
struct State {
    next_id: i64,
    entities: BTreeMap<EntityId, Entity>,
    users: BTreeMap<UserId, User>,
    links: BTreeMap<LinkId, Link>,
    audit: Vec<AuditEntry>,
}

impl State {
    fn duplicate_of(&self, link: &Link) -> Option<&Link> {
        self.links.values().find(|l| {
            l.id != link.id && l.kind == link.kind && l.left == link.left && l.right == link.right
        })
    }

    fn apply(&mut self, write: Write, outcome: &mut BatchOutcome) -> Result<()> {
        match write {
            Write::Save(mut entity) => {
                if let Some(stored) = self.entities.get(&entity.id) {
                    entity.relationship_updated_at = stored.relationship_updated_at;
                    entity.relationship_updated_by = stored.relationship_updated_by;
                }
                self.entities.insert(entity.id, entity);
            }
            Write::SaveUser(user) => {
                self.users.insert(user.id, user);
            }
            Write::Stamp { target, stamp } => {
                let hit = match target {
                    Endpoint::Entity(id) => self.entities.get_mut(&id).map(|e| {
                        e.relationship_updated_at = Some(stamp.at);
                        e.relationship_updated_by = Some(stamp.by);
                    }),
                    Endpoint::User(id) => self.users.get_mut(&id).map(|u| {
                        u.relationship_updated_at = Some(stamp.at);
                        u.relationship_updated_by = Some(stamp.by);
                    }),
                };
                if hit.is_some() {
                    outcome.stamped.push(target);
                } else {
                    outcome.skipped.push(target);
                }
            }
            Write::InsertLink(link) => {
                if self.links.contains_key(&link.id) || self.duplicate_of(&link).is_some() {
                    return Err(TrackerError::Database(format!(
                        "duplicate {} link {} → {}",
                        link.kind, link.left, link.right
                    )));
                }
                self.links.insert(link.id, link);
            }
            Write::ReplaceLink(link) => {
                if !self.links.contains_key(&link.id) {
                    return Err(TrackerError::NotFound(link.id.to_string()));
                }
                if self.duplicate_of(&link).is_some() {
                    return Err(TrackerError::Database(format!(
                        "duplicate {} link {} → {}",
                        link.kind, link.left, link.right
                    )));
                }
                self.links.insert(link.id, link);
            }
            Write::RemoveLink(id) => {
                self.links.remove(&id);
            }
            Write::Destroy(id) => {
                self.entities.remove(&id);
                self.links.retain(|_, l| !l.touches(Endpoint::Entity(id)));
            }
            Write::Audit {
                event,
                actor,
                subject,
                details,
                at,
            } => {
                let id = self.audit.len() as i64 + 1;
                self.audit.push(AuditEntry {
                    id,
                    event,
                    actor,
                    subject,
                    details,
                    created_at: at,
                });
            }
        }
        Ok(())
    }
}

/// Thread-safe in-memory [`EntityStore`].
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| TrackerError::Database("store lock poisoned".into()))
    }

    pub fn link_count(&self) -> usize {
        self.lock().map(|s| s.links.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for MemoryStore {
    fn next_id(&self) -> Result<i64> {
        let mut state = self.lock()?;
        state.next_id += 1;
        Ok(state.next_id)
    }

    fn entity(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.lock()?.entities.get(&id).cloned())
    }

    fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        Ok(self
            .lock()?
            .entities
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn link(&self, id: LinkId) -> Result<Option<Link>> {
        Ok(self.lock()?.links.get(&id).cloned())
    }

    fn links_for(&self, endpoint: Endpoint) -> Result<Vec<Link>> {
        Ok(self
            .lock()?
            .links
            .values()
            .filter(|l| l.touches(endpoint))
            .cloned()
            .collect())
    }

    fn find_link(&self, kind: LinkKind, left: Endpoint, right: Endpoint) -> Result<Option<Link>> {
        Ok(self
            .lock()?
            .links
            .values()
            .find(|l| l.kind == kind && l.left == left && l.right == right)
            .cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<BatchOutcome> {
        let mut state = self.lock()?;
        let mut draft = state.clone();
        let mut outcome = BatchOutcome::default();
        for write in batch.into_writes() {
            draft.apply(write, &mut outcome)?;
        }
        *state = draft;
        Ok(outcome)
    }

    fn audit_trail(&self, subject: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|a| a.subject == subject)
            .cloned()
            .collect())
    }
}
