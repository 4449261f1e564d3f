//! Tracker service — the write paths of the admin backend.
//!
//! Every entry point takes the acting user explicitly. A call authorizes,
//! validates, builds one [`WriteBatch`] (record write, relationship stamps,
//! audit rows), commits it, and only then runs the debouncer for entities
//! whose relationship stamp moved.
//!
//! ```text
//! update_entity ─ classify ─ Save (+Stamp if notifiable) ─┐
//! create/update/destroy link ─ Insert/Replace/Remove ─────┼─ commit ─ debounce ─ JobQueue
//! destroy_entity ─ RemoveLink* + Destroy + Stamp* ────────┘
//! ```
//!
//! Creating a UserMeasure link also enqueues an immediate assignment mail
//! for the new assignee, unless they assigned themselves or the task is
//! not live.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actiontrack_core::config::{NotificationConfig, TypeRegistry};
use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::policy::{self, Action, Resource, Role, VisibilityScope};
use actiontrack_core::traits::{EntityStore, JobHandle, JobPayload, JobQueue, Write, WriteBatch};
use actiontrack_core::types::{
    AuditEntry, Endpoint, Entity, EntityId, EntityKind, Link, LinkId, LinkKind, Stamp, User,
    UserId,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::classify::{self, Verdict};
use crate::debounce::{DebounceReport, NotificationDebouncer};
use crate::touch::TouchPropagator;
use crate::validate::Validator;

/// Attributes of a record to create.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub kind: EntityKind,
    pub title: String,
    pub type_id: Option<i64>,
    pub parent_id: Option<EntityId>,
    pub fields: BTreeMap<String, Value>,
    pub draft: bool,
    pub private: bool,
    pub notifications: bool,
}

impl NewEntity {
    pub fn new(kind: EntityKind, title: &str) -> Self {
        Self {
            kind,
            title: title.to_string(),
            type_id: None,
            parent_id: None,
            fields: BTreeMap::new(),
            draft: false,
            private: false,
            notifications: true,
        }
    }

    pub fn type_id(mut self, id: i64) -> Self {
        self.type_id = Some(id);
        self
    }

    pub fn parent(mut self, id: EntityId) -> Self {
        self.parent_id = Some(id);
        self
    }

    pub fn draft(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }
}

/// Partial update. `None` leaves an attribute alone; a `Null` field value
/// removes that field.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub title: Option<String>,
    pub type_id: Option<i64>,
    pub parent_id: Option<Option<EntityId>>,
    pub fields: BTreeMap<String, Value>,
    pub draft: Option<bool>,
    pub is_archive: Option<bool>,
    pub private: Option<bool>,
    pub notifications: Option<bool>,
}

impl EntityPatch {
    pub fn title(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    fn apply(&self, entity: &mut Entity) {
        if let Some(title) = &self.title {
            entity.title = title.clone();
        }
        if let Some(type_id) = self.type_id {
            entity.type_id = Some(type_id);
        }
        if let Some(parent_id) = self.parent_id {
            entity.parent_id = parent_id;
        }
        for (name, value) in &self.fields {
            if value.is_null() {
                entity.fields.remove(name);
            } else {
                entity.fields.insert(name.clone(), value.clone());
            }
        }
        if let Some(draft) = self.draft {
            entity.draft = draft;
        }
        if let Some(is_archive) = self.is_archive {
            entity.is_archive = is_archive;
        }
        if let Some(private) = self.private {
            entity.private = private;
        }
        if let Some(notifications) = self.notifications {
            entity.notifications = notifications;
        }
    }
}

/// A committed write and the notification work it caused.
#[derive(Debug, Clone)]
pub struct Committed<T> {
    pub record: T,
    pub notifications: Vec<DebounceReport>,
    /// Assignment mail job, for new UserMeasure links.
    pub assignment: Option<JobHandle>,
}

impl<T> Committed<T> {
    fn new(record: T, notifications: Vec<DebounceReport>) -> Self {
        Self {
            record,
            notifications,
            assignment: None,
        }
    }
}

/// Relationship stamps of entity endpoints, taken before a commit.
type StampSnapshot = Vec<(EntityId, Option<DateTime<Utc>>)>;

pub struct Tracker {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn JobQueue>,
    types: Arc<TypeRegistry>,
    notifications: NotificationConfig,
}

impl Tracker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn JobQueue>,
        types: Arc<TypeRegistry>,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            store,
            queue,
            types,
            notifications,
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // ─── Users ──────────────────────────────────────────────

    /// Register an account. Account management has no acting user.
    pub fn create_user(&self, name: &str, email: &str, roles: Vec<Role>) -> Result<User> {
        if name.trim().is_empty() {
            return Err(TrackerError::validation("name", "can't be blank"));
        }
        if !email.contains('@') {
            return Err(TrackerError::validation("email", "is invalid"));
        }
        let user = User::new(UserId(self.store.next_id()?), name, email, roles);
        let mut batch = WriteBatch::new();
        batch.push(Write::SaveUser(user.clone())).push(Write::Audit {
            event: "create".into(),
            actor: None,
            subject: user.id.to_string(),
            details: None,
            at: Utc::now(),
        });
        self.store.write(batch)?;
        tracing::info!("👤 User created: {} ({})", user.name, user.id);
        Ok(user)
    }

    // ─── Entities ───────────────────────────────────────────

    pub fn create_entity(&self, actor: UserId, new: NewEntity) -> Result<Entity> {
        let user = self.acting(actor)?;
        self.authorize(&user, Action::Create, Resource::Entity(new.kind))?;

        let mut entity = Entity::new(EntityId(self.store.next_id()?), new.kind, &new.title);
        entity.type_id = new.type_id;
        entity.parent_id = new.parent_id;
        entity.fields = new.fields;
        entity.draft = new.draft;
        entity.private = new.private;
        entity.notifications = new.notifications;
        entity.created_by = Some(actor);
        Validator::new(self.store.as_ref(), &self.types).entity(&entity)?;

        let mut batch = WriteBatch::new();
        batch.push(Write::Save(entity.clone())).push(Write::Audit {
            event: "create".into(),
            actor: Some(actor),
            subject: entity.subject_key(),
            details: Some(entity.title.clone()),
            at: entity.created_at,
        });
        self.store.write(batch)?;
        tracing::info!("📝 {} created: '{}' ({})", entity.kind, entity.title, entity.id);
        Ok(entity)
    }

    /// Full save. The only path that runs the change classifier; a notifiable
    /// change adds a relationship stamp to the same batch. The save itself
    /// never writes the stamp columns.
    pub fn update_entity(
        &self,
        actor: UserId,
        id: EntityId,
        patch: EntityPatch,
    ) -> Result<Committed<Entity>> {
        let user = self.acting(actor)?;
        let prev = self.existing(id)?;
        self.authorize(&user, Action::Update, Resource::Entity(prev.kind))?;

        let now = Utc::now();
        let mut next = prev.clone();
        patch.apply(&mut next);
        next.updated_at = now;
        Validator::new(self.store.as_ref(), &self.types).entity(&next)?;

        let changed = classify::changed_fields(&prev, &next);
        let verdict = classify::classify_with(&self.types, &prev, &next);

        let mut batch = WriteBatch::new();
        let subject = next.subject_key();
        batch.push(Write::Save(next));
        if verdict.is_notifiable() {
            batch.push(Write::Stamp {
                target: Endpoint::Entity(id),
                stamp: Stamp { at: now, by: actor },
            });
        } else if verdict != Verdict::Disabled {
            tracing::debug!("{id} saved without notification: {verdict:?}");
        }
        batch.push(Write::Audit {
            event: "update".into(),
            actor: Some(actor),
            subject,
            details: Some(changed.into_iter().collect::<Vec<_>>().join(",")),
            at: now,
        });
        self.store.write(batch)?;

        let notifications = self.after_commit(vec![(id, prev.relationship_updated_at)], actor);
        Ok(Committed::new(self.existing(id)?, notifications))
    }

    /// Destroy a record, its links, and stamp the records it was linked to.
    pub fn destroy_entity(&self, actor: UserId, id: EntityId) -> Result<Committed<EntityId>> {
        let user = self.acting(actor)?;
        let entity = self.existing(id)?;
        self.authorize(&user, Action::Destroy, Resource::Entity(entity.kind))?;

        let links = self.store.links_for(Endpoint::Entity(id))?;
        let survivors: Vec<Endpoint> = links
            .iter()
            .filter_map(|l| l.other(Endpoint::Entity(id)))
            .collect();
        let before = self.snapshot(&survivors)?;

        let now = Utc::now();
        let touch = TouchPropagator::new(now, actor);
        let mut batch = WriteBatch::new();
        batch.extend(links.iter().map(|l| Write::RemoveLink(l.id)));
        batch.push(Write::Destroy(id));
        batch.extend(touch.links_removed(&links));
        batch.push(Write::Audit {
            event: "destroy".into(),
            actor: Some(actor),
            subject: entity.subject_key(),
            details: Some(entity.title.clone()),
            at: now,
        });
        let outcome = self.store.write(batch)?;
        tracing::info!(
            "🗑️ {} destroyed: {id} ({} links, {} stamped)",
            entity.kind,
            links.len(),
            outcome.stamped.len()
        );

        let notifications = self.after_commit(before, actor);
        Ok(Committed::new(id, notifications))
    }

    /// Records of `kind` the user may see.
    pub fn visible_entities(&self, actor: UserId, kind: EntityKind) -> Result<Vec<Entity>> {
        let user = self.acting(actor)?;
        self.authorize(&user, Action::Index, Resource::Entity(kind))?;
        Ok(VisibilityScope::for_user(&user).filter(self.store.entities(kind)?))
    }

    /// One record, if the user may see it.
    pub fn entity(&self, actor: UserId, id: EntityId) -> Result<Entity> {
        let user = self.acting(actor)?;
        let entity = self.existing(id)?;
        self.authorize(&user, Action::Show, Resource::Entity(entity.kind))?;
        if !VisibilityScope::for_user(&user).permits(&entity) {
            return Err(TrackerError::NotFound(id.to_string()));
        }
        Ok(entity)
    }

    /// Change history of one record, oldest first.
    pub fn audit_trail(&self, actor: UserId, id: EntityId) -> Result<Vec<AuditEntry>> {
        let entity = self.entity(actor, id)?;
        self.store.audit_trail(&entity.subject_key())
    }

    // ─── Links ──────────────────────────────────────────────

    pub fn create_link(
        &self,
        actor: UserId,
        kind: LinkKind,
        left: Endpoint,
        right: Endpoint,
    ) -> Result<Committed<Link>> {
        let user = self.acting(actor)?;
        self.authorize(&user, Action::Create, Resource::Link(kind))?;
        Validator::new(self.store.as_ref(), &self.types).link(kind, left, right, None)?;

        let now = Utc::now();
        let link = Link {
            id: LinkId(self.store.next_id()?),
            kind,
            left,
            right,
            created_by: Some(actor),
            created_at: now,
        };
        let before = self.snapshot(&link.endpoints())?;
        let mut batch = WriteBatch::new();
        batch.push(Write::InsertLink(link.clone()));
        batch.extend(TouchPropagator::new(now, actor).link_committed(&link));
        batch.push(link_audit("create", actor, &link, now));
        self.store.write(batch)?;
        tracing::info!("🔗 {} link created: {} → {}", kind, left, right);

        let notifications = self.after_commit(before, actor);
        let assignment = self.assignment_mail(&link, actor);
        Ok(Committed {
            assignment,
            ..Committed::new(link, notifications)
        })
    }

    /// Re-point an existing link. Both the old and the new endpoints are
    /// stamped.
    pub fn update_link(
        &self,
        actor: UserId,
        id: LinkId,
        left: Endpoint,
        right: Endpoint,
    ) -> Result<Committed<Link>> {
        let user = self.acting(actor)?;
        let old = self
            .store
            .link(id)?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        self.authorize(&user, Action::Update, Resource::Link(old.kind))?;
        Validator::new(self.store.as_ref(), &self.types).link(old.kind, left, right, Some(id))?;

        let now = Utc::now();
        let link = Link {
            left,
            right,
            ..old.clone()
        };
        let touched: Vec<Endpoint> = old.endpoints().into_iter().chain(link.endpoints()).collect();
        let before = self.snapshot(&touched)?;
        let mut batch = WriteBatch::new();
        batch.push(Write::ReplaceLink(link.clone()));
        batch.extend(TouchPropagator::new(now, actor).endpoints(touched));
        batch.push(link_audit("update", actor, &link, now));
        self.store.write(batch)?;

        let notifications = self.after_commit(before, actor);
        Ok(Committed::new(link, notifications))
    }

    pub fn destroy_link(&self, actor: UserId, id: LinkId) -> Result<Committed<LinkId>> {
        let user = self.acting(actor)?;
        let link = self
            .store
            .link(id)?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        self.authorize(&user, Action::Destroy, Resource::Link(link.kind))?;

        let now = Utc::now();
        let before = self.snapshot(&link.endpoints())?;
        let mut batch = WriteBatch::new();
        batch.push(Write::RemoveLink(id));
        batch.extend(TouchPropagator::new(now, actor).link_committed(&link));
        batch.push(link_audit("destroy", actor, &link, now));
        self.store.write(batch)?;
        tracing::info!("🔗 {} link removed: {} → {}", link.kind, link.left, link.right);

        let notifications = self.after_commit(before, actor);
        Ok(Committed::new(id, notifications))
    }

    /// Assign `user` to a task (a UserMeasure link).
    pub fn subscribe(&self, actor: UserId, user: UserId, task: EntityId) -> Result<Committed<Link>> {
        self.create_link(
            actor,
            LinkKind::UserMeasure,
            Endpoint::User(user),
            Endpoint::Entity(task),
        )
    }

    /// The UserMeasure link between `user` and `task`, if any.
    pub fn subscription(&self, user: UserId, task: EntityId) -> Result<Option<Link>> {
        self.store.find_link(
            LinkKind::UserMeasure,
            Endpoint::User(user),
            Endpoint::Entity(task),
        )
    }

    /// Users assigned to `task`.
    pub fn subscribers(&self, task: EntityId) -> Result<Vec<UserId>> {
        let subject = Endpoint::Entity(task);
        Ok(self
            .store
            .links_for(subject)?
            .into_iter()
            .filter(|l| l.kind.is_subscription() && l.right == subject)
            .filter_map(|l| match l.left {
                Endpoint::User(id) => Some(id),
                Endpoint::Entity(_) => None,
            })
            .collect())
    }

    // ─── Internals ──────────────────────────────────────────

    fn acting(&self, actor: UserId) -> Result<User> {
        self.store
            .user(actor)?
            .ok_or_else(|| TrackerError::NoPermission("must be logged in".into()))
    }

    fn authorize(&self, user: &User, action: Action, resource: Resource) -> Result<()> {
        if policy::authorize(user, action, resource) {
            Ok(())
        } else {
            Err(TrackerError::NoPermission(format!(
                "{} may not {action:?} {resource:?}",
                user.id
            )))
        }
    }

    fn existing(&self, id: EntityId) -> Result<Entity> {
        self.store
            .entity(id)?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    fn snapshot(&self, endpoints: &[Endpoint]) -> Result<StampSnapshot> {
        let mut out: StampSnapshot = Vec::new();
        for endpoint in endpoints {
            if let Endpoint::Entity(id) = *endpoint
                && !out.iter().any(|(seen, _)| *seen == id)
                && let Some(entity) = self.store.entity(id)?
            {
                out.push((id, entity.relationship_updated_at));
            }
        }
        Ok(out)
    }

    /// Enqueue the assignment mail for a new UserMeasure link. Skipped when
    /// the assignee is the acting user or the task is draft, archived or has
    /// notifications off. Runs after commit, so failures are logged.
    fn assignment_mail(&self, link: &Link, actor: UserId) -> Option<JobHandle> {
        let (LinkKind::UserMeasure, Endpoint::User(assignee), Endpoint::Entity(task)) =
            (link.kind, link.left, link.right)
        else {
            return None;
        };
        if !self.notifications.enabled || assignee == actor {
            return None;
        }
        let result = self.store.entity(task).and_then(|measure| match measure {
            Some(measure) if classify::assignment_notifiable(&measure) => self
                .queue
                .enqueue(Duration::ZERO, JobPayload::assigned(assignee, task))
                .map(Some),
            _ => Ok(None),
        });
        match result {
            Ok(Some(handle)) => {
                tracing::info!("📨 Assignment mail queued for {assignee} on {task}");
                Some(handle)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ Could not queue assignment mail for {assignee} on {task}: {e}");
                None
            }
        }
    }

    /// Debounce every entity whose stamp moved in the commit and which is
    /// notifiable now. The commit already happened, so failures here are
    /// logged, not returned.
    fn after_commit(&self, before: StampSnapshot, actor: UserId) -> Vec<DebounceReport> {
        if !self.notifications.enabled {
            return Vec::new();
        }
        let debouncer = NotificationDebouncer::new(self.queue.as_ref(), self.notifications.delay());
        let mut reports = Vec::new();
        for (id, stamp_before) in before {
            let result = self.store.entity(id).and_then(|current| {
                let Some(current) = current else {
                    return Ok(None);
                };
                let notifiable = classify::is_notifiable(&self.types, &current);
                if !NotificationDebouncer::should_trigger(
                    stamp_before,
                    current.relationship_updated_at,
                    notifiable,
                ) {
                    return Ok(None);
                }
                let subscribers = self.subscribers(id)?;
                debouncer.schedule(id, &subscribers, actor).map(Some)
            });
            match result {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Could not schedule notifications for {id}: {e}"),
            }
        }
        reports
    }
}

fn link_audit(event: &str, actor: UserId, link: &Link, at: DateTime<Utc>) -> Write {
    Write::Audit {
        event: event.into(),
        actor: Some(actor),
        subject: link.id.to_string(),
        details: Some(format!("{} {} → {}", link.kind, link.left, link.right)),
        at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TaskDispatcher;
    use crate::engine::NotificationWorker;
    use crate::queue::MemoryJobQueue;
    use crate::store::MemoryStore;
    use actiontrack_channels::OutboxMailer;
    use actiontrack_core::config::TASK_MEASURETYPE_ID;
    use actiontrack_core::traits::{BatchOutcome, JobFilter, JobKind, JobState};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        tracker: Tracker,
        queue: Arc<MemoryJobQueue>,
        outbox: Arc<OutboxMailer>,
        worker: NotificationWorker,
        /// Admin who sets things up and edits.
        cora: UserId,
        /// Manager subscriber.
        abe: UserId,
        /// Analyst subscriber.
        bo: UserId,
        task: EntityId,
    }

    impl Harness {
        fn pending(&self) -> Vec<UserId> {
            let mut users: Vec<UserId> = self
                .queue
                .list_pending(&JobFilter::subject(self.task).kind(JobKind::TaskUpdated))
                .unwrap()
                .into_iter()
                .map(|j| j.payload.recipient)
                .collect();
            users.sort();
            users
        }

        /// Drop jobs left over from setup.
        fn settle(&self) {
            for job in self.queue.list_pending(&JobFilter::all()).unwrap() {
                self.queue.cancel(&job.handle).unwrap();
            }
        }

        async fn fire(&self) -> Vec<String> {
            let later = Utc::now() + chrono::Duration::seconds(21);
            self.worker.run_due(later).await.unwrap();
            let mut to: Vec<String> = self.outbox.sent().into_iter().map(|m| m.to).collect();
            to.sort();
            to
        }
    }

    fn harness_with(config: NotificationConfig, draft: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let outbox = Arc::new(OutboxMailer::new());
        let types = Arc::new(TypeRegistry::default());
        let tracker = Tracker::new(store.clone(), queue.clone(), types.clone(), config);
        let dispatcher = TaskDispatcher::new(store, outbox.clone(), types);
        let worker = NotificationWorker::new(queue.clone(), dispatcher, 50);

        let cora = tracker
            .create_user("Cora", "cora@example.org", vec![Role::Admin])
            .unwrap()
            .id;
        let abe = tracker
            .create_user("Abe", "abe@example.org", vec![Role::Manager])
            .unwrap()
            .id;
        let bo = tracker
            .create_user("Bo", "bo@example.org", vec![Role::Analyst])
            .unwrap()
            .id;
        let task = tracker
            .create_entity(
                cora,
                NewEntity::new(EntityKind::Measure, "Survey wetlands")
                    .type_id(TASK_MEASURETYPE_ID)
                    .draft(draft),
            )
            .unwrap()
            .id;
        tracker.subscribe(cora, abe, task).unwrap();
        tracker.subscribe(cora, bo, task).unwrap();

        let h = Harness {
            tracker,
            queue,
            outbox,
            worker,
            cora,
            abe,
            bo,
            task,
        };
        h.settle();
        h
    }

    fn harness() -> Harness {
        harness_with(NotificationConfig::default(), false)
    }

    #[tokio::test]
    async fn test_two_quick_edits_one_mail_each() {
        let h = harness();
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        let second = h
            .tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v3"))
            .unwrap();
        assert_eq!(second.notifications.len(), 1);
        assert_eq!(second.notifications[0].cancelled.len(), 2);
        assert_eq!(h.pending(), vec![h.abe, h.bo]);

        // Nothing fires before the delay.
        assert_eq!(h.worker.run_due(Utc::now()).await.unwrap().claimed, 0);

        assert_eq!(h.fire().await, vec!["abe@example.org", "bo@example.org"]);
        let sent = h.outbox.sent();
        assert!(sent.iter().all(|m| m.subject == "Task updated: Survey wetlands v3"));
        assert!(sent[0].body.contains("by Cora"));
    }

    #[tokio::test]
    async fn test_editor_is_not_notified() {
        let h = harness();
        let committed = h
            .tracker
            .update_entity(h.abe, h.task, EntityPatch::default().field("budget", 10.into()))
            .unwrap();
        assert_eq!(committed.notifications[0].recipients, vec![h.bo]);
        assert_eq!(h.pending(), vec![h.bo]);
        assert_eq!(h.fire().await, vec!["bo@example.org"]);
    }

    #[tokio::test]
    async fn test_sole_subscriber_editing_gets_nothing() {
        let h = harness();
        let sub = h.tracker.subscription(h.bo, h.task).unwrap().unwrap();
        h.tracker.destroy_link(h.cora, sub.id).unwrap();
        h.settle();

        h.tracker
            .update_entity(h.abe, h.task, EntityPatch::title("Abe's own edit"))
            .unwrap();
        assert!(h.pending().is_empty());
        assert!(h.fire().await.is_empty());
    }

    #[tokio::test]
    async fn test_publishing_from_draft_is_silent() {
        let h = harness_with(NotificationConfig::default(), true);
        // Subscribing to a draft enqueued nothing either.
        let committed = h
            .tracker
            .update_entity(
                h.cora,
                h.task,
                EntityPatch {
                    draft: Some(false),
                    title: Some("Survey wetlands (final)".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(committed.notifications.is_empty());
        assert!(h.pending().is_empty());
        assert!(h.fire().await.is_empty());

        // Once published, a separate edit notifies as usual.
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands (final v2)"))
            .unwrap();
        assert_eq!(h.pending(), vec![h.abe, h.bo]);
    }

    #[tokio::test]
    async fn test_edits_in_draft_are_silent() {
        let h = harness_with(NotificationConfig::default(), true);
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Still drafting"))
            .unwrap();
        assert!(h.pending().is_empty());
    }

    #[tokio::test]
    async fn test_archiving_suppresses_pending_mail() {
        let h = harness();
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        let archived = h
            .tracker
            .update_entity(
                h.cora,
                h.task,
                EntityPatch {
                    is_archive: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(archived.notifications.is_empty());
        assert_eq!(h.pending().len(), 2);
        assert!(h.fire().await.is_empty());
        assert!(h
            .queue
            .snapshot()
            .iter()
            .filter(|j| j.payload.subject == h.task)
            .any(|j| j.state == JobState::Suppressed));
    }

    #[tokio::test]
    async fn test_unarchive_alone_is_bookkeeping() {
        let h = harness();
        let archive = |flag: bool| EntityPatch {
            is_archive: Some(flag),
            ..Default::default()
        };
        h.tracker.update_entity(h.cora, h.task, archive(true)).unwrap();
        h.tracker.update_entity(h.cora, h.task, archive(false)).unwrap();
        assert!(h.pending().is_empty());

        h.tracker.update_entity(h.cora, h.task, archive(true)).unwrap();
        let mut patch = archive(false);
        patch.title = Some("Back on".into());
        h.tracker.update_entity(h.cora, h.task, patch).unwrap();
        assert_eq!(h.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_task_sends_nothing() {
        let h = harness();
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        let destroyed = h.tracker.destroy_entity(h.cora, h.task).unwrap();
        assert!(destroyed.notifications.is_empty());
        assert!(h.fire().await.is_empty());
        assert!(h.tracker.subscribers(h.task).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bookkeeping_only_save_enqueues_nothing() {
        let h = harness();
        let committed = h
            .tracker
            .update_entity(h.cora, h.task, EntityPatch::default())
            .unwrap();
        assert!(committed.notifications.is_empty());
        assert!(committed.record.relationship_updated_at.is_some());
        assert!(h.pending().is_empty());
    }

    #[tokio::test]
    async fn test_link_change_stamps_and_notifies() {
        let h = harness();
        let indicator = h
            .tracker
            .create_entity(h.cora, NewEntity::new(EntityKind::Indicator, "Hectares surveyed"))
            .unwrap();
        let link = h
            .tracker
            .create_link(
                h.cora,
                LinkKind::MeasureIndicator,
                Endpoint::Entity(h.task),
                Endpoint::Entity(indicator.id),
            )
            .unwrap();
        assert_eq!(link.notifications.len(), 1);
        let task = h.tracker.entity(h.cora, h.task).unwrap();
        assert_eq!(task.relationship_updated_by, Some(h.cora));
        let indicator = h.tracker.entity(h.cora, indicator.id).unwrap();
        assert_eq!(indicator.relationship_updated_by, Some(h.cora));
        assert_eq!(h.pending(), vec![h.abe, h.bo]);

        h.tracker.destroy_link(h.cora, link.record.id).unwrap();
        assert_eq!(h.fire().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribed_user_gets_nothing() {
        let h = harness();
        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        let duplicate = h.tracker.subscribe(h.cora, h.abe, h.task).unwrap_err();
        assert_eq!(duplicate.to_string(), "user_id has already been taken");

        let sub = h.tracker.subscription(h.abe, h.task).unwrap().unwrap();
        h.tracker.destroy_link(h.cora, sub.id).unwrap();
        assert_eq!(h.fire().await, vec!["bo@example.org"]);
    }

    #[tokio::test]
    async fn test_rejected_writes_enqueue_nothing() {
        let h = harness();
        let err = h
            .tracker
            .update_entity(h.cora, h.task, EntityPatch::title("  "))
            .unwrap_err();
        assert_eq!(err.to_string(), "title can't be blank");

        let err = h
            .tracker
            .update_entity(h.bo, h.task, EntityPatch::title("Analyst edit"))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoPermission(_)));

        let err = h
            .tracker
            .update_entity(UserId(999), h.task, EntityPatch::title("Ghost"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Permission denied: must be logged in");
        assert!(h.pending().is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_cannot_be_repointed() {
        let h = harness();
        let sub = h.tracker.subscription(h.abe, h.task).unwrap().unwrap();
        let err = h
            .tracker
            .update_link(h.cora, sub.id, Endpoint::User(h.cora), Endpoint::Entity(h.task))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoPermission(_)));
    }

    #[tokio::test]
    async fn test_globally_disabled() {
        let config = NotificationConfig {
            enabled: false,
            ..Default::default()
        };
        let h = harness_with(config, false);
        let committed = h
            .tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Quiet edit"))
            .unwrap();
        assert!(committed.notifications.is_empty());
        assert!(h.pending().is_empty());
    }

    #[test]
    fn test_visibility_and_audit() {
        let h = harness();
        let hidden = h
            .tracker
            .create_entity(
                h.abe,
                NewEntity::new(EntityKind::Measure, "Private plan")
                    .type_id(TASK_MEASURETYPE_ID)
                    .private(true),
            )
            .unwrap();

        let for_abe = h.tracker.visible_entities(h.abe, EntityKind::Measure).unwrap();
        assert_eq!(for_abe.len(), 2);
        let for_bo = h.tracker.visible_entities(h.bo, EntityKind::Measure).unwrap();
        assert_eq!(for_bo.len(), 1);
        assert!(matches!(
            h.tracker.entity(h.bo, hidden.id),
            Err(TrackerError::NotFound(_))
        ));

        h.tracker
            .update_entity(h.cora, h.task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        let trail = h.tracker.audit_trail(h.cora, h.task).unwrap();
        let events: Vec<&str> = trail.iter().map(|a| a.event.as_str()).collect();
        assert_eq!(events, vec!["create", "update"]);
        assert_eq!(trail[1].details.as_deref(), Some("title,updated_at"));
        assert_eq!(trail[1].actor, Some(h.cora));
    }

    #[test]
    fn test_parent_rules() {
        let h = harness();
        let child = h
            .tracker
            .create_entity(
                h.cora,
                NewEntity::new(EntityKind::Measure, "Subtask")
                    .type_id(TASK_MEASURETYPE_ID)
                    .parent(h.task),
            )
            .unwrap();
        let err = h
            .tracker
            .update_entity(
                h.cora,
                h.task,
                EntityPatch {
                    parent_id: Some(Some(child.id)),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "parent_id can't be its own descendant");
    }

    #[tokio::test]
    async fn test_fixed_link_kinds_cannot_be_repointed() {
        let h = harness();
        let other = h
            .tracker
            .create_entity(
                h.cora,
                NewEntity::new(EntityKind::Measure, "Map reed beds").type_id(TASK_MEASURETYPE_ID),
            )
            .unwrap();
        let third = h
            .tracker
            .create_entity(
                h.cora,
                NewEntity::new(EntityKind::Measure, "Count herons").type_id(TASK_MEASURETYPE_ID),
            )
            .unwrap();
        let link = h
            .tracker
            .create_link(
                h.cora,
                LinkKind::MeasureMeasure,
                Endpoint::Entity(h.task),
                Endpoint::Entity(other.id),
            )
            .unwrap()
            .record;
        let err = h
            .tracker
            .update_link(h.cora, link.id, Endpoint::Entity(h.task), Endpoint::Entity(third.id))
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoPermission(_)));
        assert_eq!(h.tracker.store.link(link.id).unwrap(), Some(link));
    }

    #[tokio::test]
    async fn test_new_assignee_gets_assignment_mail() {
        let h = harness();
        let dee = h
            .tracker
            .create_user("Dee", "dee@example.org", vec![Role::Analyst])
            .unwrap()
            .id;
        let committed = h.tracker.subscribe(h.cora, dee, h.task).unwrap();
        assert!(committed.assignment.is_some());

        // Fires at once, without waiting for the debounce window.
        let stats = h.worker.run_due(Utc::now()).await.unwrap();
        assert_eq!(stats.sent, 1);
        let sent = h.outbox.sent();
        assert_eq!(sent[0].to, "dee@example.org");
        assert_eq!(sent[0].subject, "Task assigned: Survey wetlands");
        assert!(sent[0].body.contains("by Cora"));
    }

    #[tokio::test]
    async fn test_self_assignment_sends_nothing() {
        let h = harness();
        let committed = h.tracker.subscribe(h.cora, h.cora, h.task).unwrap();
        assert!(committed.assignment.is_none());
        assert!(h
            .queue
            .list_pending(&JobFilter::all().kind(JobKind::Assigned))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_assignment_to_draft_sends_nothing() {
        let h = harness_with(NotificationConfig::default(), true);
        let dee = h
            .tracker
            .create_user("Dee", "dee@example.org", vec![Role::Analyst])
            .unwrap()
            .id;
        let committed = h.tracker.subscribe(h.cora, dee, h.task).unwrap();
        assert!(committed.assignment.is_none());
        assert_eq!(h.worker.run_due(Utc::now()).await.unwrap().claimed, 0);
        assert!(h.outbox.sent().is_empty());
    }

    /// Commits a relationship stamp by `racer` just ahead of any batch that
    /// saves a record, as a concurrent link write would.
    struct RacyStore {
        inner: MemoryStore,
        racer: UserId,
        armed: AtomicBool,
    }

    impl EntityStore for RacyStore {
        fn next_id(&self) -> Result<i64> {
            self.inner.next_id()
        }

        fn entity(&self, id: EntityId) -> Result<Option<Entity>> {
            self.inner.entity(id)
        }

        fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
            self.inner.entities(kind)
        }

        fn user(&self, id: UserId) -> Result<Option<User>> {
            self.inner.user(id)
        }

        fn link(&self, id: LinkId) -> Result<Option<Link>> {
            self.inner.link(id)
        }

        fn links_for(&self, endpoint: Endpoint) -> Result<Vec<Link>> {
            self.inner.links_for(endpoint)
        }

        fn find_link(&self, kind: LinkKind, left: Endpoint, right: Endpoint) -> Result<Option<Link>> {
            self.inner.find_link(kind, left, right)
        }

        fn write(&self, batch: WriteBatch) -> Result<BatchOutcome> {
            let saved = batch.writes().iter().find_map(|w| match w {
                Write::Save(entity) => Some(entity.id),
                _ => None,
            });
            if let Some(id) = saved
                && self.armed.swap(false, Ordering::SeqCst)
            {
                let mut race = WriteBatch::new();
                race.push(Write::Stamp {
                    target: Endpoint::Entity(id),
                    stamp: Stamp {
                        at: Utc::now(),
                        by: self.racer,
                    },
                });
                self.inner.write(race)?;
            }
            self.inner.write(batch)
        }

        fn audit_trail(&self, subject: &str) -> Result<Vec<AuditEntry>> {
            self.inner.audit_trail(subject)
        }
    }

    #[test]
    fn test_save_does_not_clobber_concurrent_stamp() {
        let racer = UserId(99);
        let store = Arc::new(RacyStore {
            inner: MemoryStore::new(),
            racer,
            armed: AtomicBool::new(false),
        });
        let tracker = Tracker::new(
            store.clone(),
            Arc::new(MemoryJobQueue::new()),
            Arc::new(TypeRegistry::default()),
            NotificationConfig::default(),
        );
        let cora = tracker
            .create_user("Cora", "cora@example.org", vec![Role::Admin])
            .unwrap()
            .id;
        let abe = tracker
            .create_user("Abe", "abe@example.org", vec![Role::Manager])
            .unwrap()
            .id;
        let task = tracker
            .create_entity(
                cora,
                NewEntity::new(EntityKind::Measure, "Survey wetlands").type_id(TASK_MEASURETYPE_ID),
            )
            .unwrap()
            .id;
        tracker.subscribe(cora, abe, task).unwrap();
        store.armed.store(true, Ordering::SeqCst);

        // Bookkeeping-only save: the racing stamp survives.
        let saved = tracker
            .update_entity(cora, task, EntityPatch::default())
            .unwrap();
        assert_eq!(saved.record.relationship_updated_by, Some(racer));

        // Notifiable save: its own stamp lands after the race.
        store.armed.store(true, Ordering::SeqCst);
        let saved = tracker
            .update_entity(cora, task, EntityPatch::title("Survey wetlands v2"))
            .unwrap();
        assert_eq!(saved.record.relationship_updated_by, Some(cora));
        assert_eq!(saved.record.title, "Survey wetlands v2");
    }
}
