//! Change classification — does a save warrant a task notification?
//!
//! Pure functions over two snapshots of the same entity. Bookkeeping
//! columns never count as a change on their own, and leaving draft is
//! never itself a notifiable event.

use std::collections::BTreeSet;

use actiontrack_core::config::TypeRegistry;
use actiontrack_core::types::Entity;

/// Fields that cannot trigger a notification by themselves.
pub const EXCLUDED_FIELDS: [&str; 4] = ["created_at", "draft", "is_archive", "updated_at"];

/// Why a save was (not) considered notifiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Notifiable,
    /// Kind/type or the record itself has notifications switched off.
    Disabled,
    Archived,
    Draft,
    /// The save moved the record out of draft.
    Published,
    /// Only excluded bookkeeping fields changed.
    BookkeepingOnly,
}

impl Verdict {
    pub fn is_notifiable(&self) -> bool {
        matches!(self, Verdict::Notifiable)
    }
}

/// Names of the attributes that differ between `prev` and `next`.
pub fn changed_fields(prev: &Entity, next: &Entity) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    let mut check = |name: &str, differs: bool| {
        if differs {
            changed.insert(name.to_string());
        }
    };

    check("title", prev.title != next.title);
    check("type_id", prev.type_id != next.type_id);
    check("parent_id", prev.parent_id != next.parent_id);
    check("draft", prev.draft != next.draft);
    check("is_archive", prev.is_archive != next.is_archive);
    check("private", prev.private != next.private);
    check("notifications", prev.notifications != next.notifications);
    check("created_by", prev.created_by != next.created_by);
    check("created_at", prev.created_at != next.created_at);
    check("updated_at", prev.updated_at != next.updated_at);
    check(
        "relationship_updated_at",
        prev.relationship_updated_at != next.relationship_updated_at,
    );
    check(
        "relationship_updated_by",
        prev.relationship_updated_by != next.relationship_updated_by,
    );

    let keys: BTreeSet<&String> = prev.fields.keys().chain(next.fields.keys()).collect();
    for key in keys {
        if prev.fields.get(key) != next.fields.get(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

/// Classify a save from `prev` to `next`.
///
/// `kind_notifies` is the type-level switch (see
/// [`TypeRegistry::notifications_enabled`]).
pub fn classify(prev: &Entity, next: &Entity, kind_notifies: bool) -> Verdict {
    if !kind_notifies || !next.notifications {
        return Verdict::Disabled;
    }
    if next.is_archive {
        return Verdict::Archived;
    }
    if next.draft {
        return Verdict::Draft;
    }
    if prev.draft {
        return Verdict::Published;
    }
    let significant = changed_fields(prev, next)
        .iter()
        .any(|f| !EXCLUDED_FIELDS.contains(&f.as_str()));
    if significant {
        Verdict::Notifiable
    } else {
        Verdict::BookkeepingOnly
    }
}

/// Convenience over [`classify`] resolving the type switch from `types`.
pub fn classify_with(types: &TypeRegistry, prev: &Entity, next: &Entity) -> Verdict {
    classify(prev, next, types.notifications_enabled(next))
}

/// Current-state eligibility: notifiable type, notifications on, published
/// and live.
pub fn is_notifiable(types: &TypeRegistry, entity: &Entity) -> bool {
    types.notifications_enabled(entity) && entity.notifications && !entity.draft && !entity.is_archive
}

/// Whether a new assignment to `entity` is worth a mail: notifications on,
/// published and live. Unlike [`is_notifiable`] this does not depend on the
/// type registry.
pub fn assignment_notifiable(entity: &Entity) -> bool {
    entity.notifications && !entity.draft && !entity.is_archive
}
