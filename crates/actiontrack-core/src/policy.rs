//! Role-based authorization — who may do what, and which records they see.

use serde::{Deserialize, Serialize};

use crate::types::{Entity, EntityKind, LinkKind, User, UserId};

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Analyst,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Analyst => "analyst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "analyst" => Some(Role::Analyst),
            _ => None,
        }
    }
}

/// CRUD action being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Index,
    Show,
    Create,
    Update,
    Destroy,
}

/// What the action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Entity(EntityKind),
    Link(LinkKind),
}

/// Decide whether `user` may perform `action` on `resource`.
pub fn authorize(user: &User, action: Action, resource: Resource) -> bool {
    if user.roles.is_empty() {
        return false;
    }
    let editor = user.has_role(Role::Admin) || user.has_role(Role::Manager);
    match (action, resource) {
        (Action::Index | Action::Show, _) => true,
        (Action::Update, Resource::Link(kind)) if !kind.is_updatable() => false,
        (Action::Create | Action::Update | Action::Destroy, _) => editor,
    }
}

/// Row-level visibility filter resolved for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityScope {
    All,
    /// Non-archived records that are public or created by this manager.
    Manager(UserId),
    /// Published, live, public records only.
    Analyst,
    Nothing,
}

impl VisibilityScope {
    /// Resolve the scope by strongest role.
    pub fn for_user(user: &User) -> Self {
        if user.has_role(Role::Admin) {
            VisibilityScope::All
        } else if user.has_role(Role::Manager) {
            VisibilityScope::Manager(user.id)
        } else if user.has_role(Role::Analyst) {
            VisibilityScope::Analyst
        } else {
            VisibilityScope::Nothing
        }
    }

    pub fn permits(&self, entity: &Entity) -> bool {
        match self {
            VisibilityScope::All => true,
            VisibilityScope::Manager(id) => {
                !entity.is_archive && (!entity.private || entity.created_by == Some(*id))
            }
            VisibilityScope::Analyst => !entity.draft && !entity.is_archive && !entity.private,
            VisibilityScope::Nothing => false,
        }
    }

    pub fn filter(&self, entities: Vec<Entity>) -> Vec<Entity> {
        entities.into_iter().filter(|e| self.permits(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    fn user(id: i64, roles: Vec<Role>) -> User {
        User::new(UserId(id), "Test", "test@example.org", roles)
    }

    #[test]
    fn test_editors_can_write() {
        let measure = Resource::Entity(EntityKind::Measure);
        assert!(authorize(&user(1, vec![Role::Admin]), Action::Create, measure));
        assert!(authorize(&user(2, vec![Role::Manager]), Action::Destroy, measure));
        assert!(!authorize(&user(3, vec![Role::Analyst]), Action::Update, measure));
        assert!(authorize(&user(3, vec![Role::Analyst]), Action::Show, measure));
    }

    #[test]
    fn test_no_roles_denied() {
        let u = user(4, vec![]);
        assert!(!authorize(&u, Action::Index, Resource::Entity(EntityKind::Actor)));
    }

    #[test]
    fn test_user_measure_never_updated() {
        let admin = user(1, vec![Role::Admin]);
        let res = Resource::Link(LinkKind::UserMeasure);
        assert!(!authorize(&admin, Action::Update, res));
        assert!(authorize(&admin, Action::Create, res));
        assert!(authorize(&admin, Action::Destroy, res));
    }

    #[test]
    fn test_fixed_link_kinds_never_updated() {
        let admin = user(1, vec![Role::Admin]);
        for kind in [LinkKind::MeasureMeasure, LinkKind::UserActor] {
            assert!(!authorize(&admin, Action::Update, Resource::Link(kind)));
            assert!(authorize(&admin, Action::Create, Resource::Link(kind)));
        }
        assert!(authorize(&admin, Action::Update, Resource::Link(LinkKind::MeasureActor)));
    }

    #[test]
    fn test_manager_scope() {
        let manager = user(10, vec![Role::Manager]);
        let scope = VisibilityScope::for_user(&manager);

        let mut own = Entity::new(EntityId(1), EntityKind::Measure, "own");
        own.private = true;
        own.created_by = Some(UserId(10));
        let mut other = own.clone();
        other.created_by = Some(UserId(11));
        let mut archived = Entity::new(EntityId(2), EntityKind::Measure, "old");
        archived.is_archive = true;

        assert!(scope.permits(&own));
        assert!(!scope.permits(&other));
        assert!(!scope.permits(&archived));
    }

    #[test]
    fn test_analyst_scope() {
        let scope = VisibilityScope::for_user(&user(5, vec![Role::Analyst]));
        let public = Entity::new(EntityId(1), EntityKind::Actor, "Norway");
        let mut draft = public.clone();
        draft.draft = true;
        let mut private = public.clone();
        private.private = true;

        let visible = scope.filter(vec![public.clone(), draft, private]);
        assert_eq!(visible, vec![public]);
    }

    #[test]
    fn test_strongest_role_wins() {
        let u = user(6, vec![Role::Analyst, Role::Admin]);
        assert_eq!(VisibilityScope::for_user(&u), VisibilityScope::All);
    }
}
