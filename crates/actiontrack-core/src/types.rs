//! Domain records — entities, users, and the link records between them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Role;

macro_rules! record_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $prefix, self.0)
            }
        }
    };
}

record_id!(EntityId, "entity");
record_id!(UserId, "user");
record_id!(LinkId, "link");

/// Kind of a primary tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Actor,
    Measure,
    Indicator,
    Category,
    Resource,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Actor => "actor",
            EntityKind::Measure => "measure",
            EntityKind::Indicator => "indicator",
            EntityKind::Category => "category",
            EntityKind::Resource => "resource",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "actor" => Some(EntityKind::Actor),
            "measure" => Some(EntityKind::Measure),
            "indicator" => Some(EntityKind::Indicator),
            "category" => Some(EntityKind::Category),
            "resource" => Some(EntityKind::Resource),
            _ => None,
        }
    }

    /// Whether records of this kind may hang under a parent of the same kind.
    pub fn supports_parent(&self) -> bool {
        matches!(self, EntityKind::Actor | EntityKind::Measure)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A primary tracked record (actor, measure, indicator, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub title: String,
    /// Actor type, measure type, or taxonomy id for categories.
    pub type_id: Option<i64>,
    pub parent_id: Option<EntityId>,
    /// Kind-specific fields (description, dates, codes, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    pub draft: bool,
    pub is_archive: bool,
    pub private: bool,
    /// Per-record switch for task notifications.
    pub notifications: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub relationship_updated_at: Option<DateTime<Utc>>,
    /// Weak reference to the user behind the last link change.
    pub relationship_updated_by: Option<UserId>,
}

impl Entity {
    /// A fresh, published, public record with notifications on.
    pub fn new(id: EntityId, kind: EntityKind, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            title: title.to_string(),
            type_id: None,
            parent_id: None,
            fields: BTreeMap::new(),
            draft: false,
            is_archive: false,
            private: false,
            notifications: true,
            created_by: None,
            created_at: now,
            updated_at: now,
            relationship_updated_at: None,
            relationship_updated_by: None,
        }
    }

    /// Audit subject key, e.g. `entity:12`.
    pub fn subject_key(&self) -> String {
        self.id.to_string()
    }
}

/// An account that acts on records and receives task notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    pub relationship_updated_at: Option<DateTime<Utc>>,
    pub relationship_updated_by: Option<UserId>,
}

impl User {
    pub fn new(id: UserId, name: &str, email: &str, roles: Vec<Role>) -> Self {
        Self {
            id,
            name: name.to_string(),
            email: email.to_string(),
            roles,
            relationship_updated_at: None,
            relationship_updated_by: None,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// One side of a link: an entity or a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Endpoint {
    Entity(EntityId),
    User(UserId),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Entity(id) => write!(f, "{id}"),
            Endpoint::User(id) => write!(f, "{id}"),
        }
    }
}

/// What a link endpoint must point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Entity(EntityKind),
    User,
}

/// Kind of many-to-many association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    ActorCategory,
    ActorMeasure,
    MeasureActor,
    MeasureMeasure,
    Membership,
    UserActor,
    UserMeasure,
    MeasureResource,
    MeasureCategory,
    MeasureIndicator,
}

impl LinkKind {
    pub const ALL: [LinkKind; 10] = [
        LinkKind::ActorCategory,
        LinkKind::ActorMeasure,
        LinkKind::MeasureActor,
        LinkKind::MeasureMeasure,
        LinkKind::Membership,
        LinkKind::UserActor,
        LinkKind::UserMeasure,
        LinkKind::MeasureResource,
        LinkKind::MeasureCategory,
        LinkKind::MeasureIndicator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkKind::ActorCategory => "actor_category",
            LinkKind::ActorMeasure => "actor_measure",
            LinkKind::MeasureActor => "measure_actor",
            LinkKind::MeasureMeasure => "measure_measure",
            LinkKind::Membership => "membership",
            LinkKind::UserActor => "user_actor",
            LinkKind::UserMeasure => "user_measure",
            LinkKind::MeasureResource => "measure_resource",
            LinkKind::MeasureCategory => "measure_category",
            LinkKind::MeasureIndicator => "measure_indicator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Required kinds of (left, right).
    pub fn endpoint_kinds(&self) -> (EndpointKind, EndpointKind) {
        use EndpointKind::{Entity as E, User as U};
        use EntityKind::*;
        match self {
            LinkKind::ActorCategory => (E(Actor), E(Category)),
            LinkKind::ActorMeasure => (E(Actor), E(Measure)),
            LinkKind::MeasureActor => (E(Measure), E(Actor)),
            LinkKind::MeasureMeasure => (E(Measure), E(Measure)),
            LinkKind::Membership => (E(Actor), E(Actor)),
            LinkKind::UserActor => (U, E(Actor)),
            LinkKind::UserMeasure => (U, E(Measure)),
            LinkKind::MeasureResource => (E(Measure), E(Resource)),
            LinkKind::MeasureCategory => (E(Measure), E(Category)),
            LinkKind::MeasureIndicator => (E(Measure), E(Indicator)),
        }
    }

    /// Attribute names of (left, right), used in validation messages.
    pub fn field_names(&self) -> (&'static str, &'static str) {
        match self {
            LinkKind::ActorCategory => ("actor", "category"),
            LinkKind::ActorMeasure => ("actor", "measure"),
            LinkKind::MeasureActor => ("measure", "actor"),
            LinkKind::MeasureMeasure => ("measure", "other_measure"),
            LinkKind::Membership => ("member", "memberof"),
            LinkKind::UserActor => ("user", "actor"),
            LinkKind::UserMeasure => ("user", "measure"),
            LinkKind::MeasureResource => ("measure", "resource"),
            LinkKind::MeasureCategory => ("measure", "category"),
            LinkKind::MeasureIndicator => ("measure", "indicator"),
        }
    }

    /// Whether an existing link of this kind may be re-pointed. Subscriptions,
    /// measure pairs and user–actor links are only created and removed.
    pub fn is_updatable(&self) -> bool {
        !matches!(
            self,
            LinkKind::UserMeasure | LinkKind::MeasureMeasure | LinkKind::UserActor
        )
    }

    /// Links whose left user receives notifications about the right entity.
    pub fn is_subscription(&self) -> bool {
        matches!(self, LinkKind::UserMeasure)
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A many-to-many association between exactly two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub kind: LinkKind,
    pub left: Endpoint,
    pub right: Endpoint,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Link {
    pub fn endpoints(&self) -> [Endpoint; 2] {
        [self.left, self.right]
    }

    /// The endpoint opposite to `endpoint`, if `endpoint` is part of this link.
    pub fn other(&self, endpoint: Endpoint) -> Option<Endpoint> {
        if self.left == endpoint {
            Some(self.right)
        } else if self.right == endpoint {
            Some(self.left)
        } else {
            None
        }
    }

    pub fn touches(&self, endpoint: Endpoint) -> bool {
        self.left == endpoint || self.right == endpoint
    }
}

/// Relationship bookkeeping applied to a record: when and by whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub at: DateTime<Utc>,
    pub by: UserId,
}

/// A row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event: String,
    pub actor: Option<UserId>,
    /// Record key, e.g. `entity:12`, `user:3` or `link:40`.
    pub subject: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}
