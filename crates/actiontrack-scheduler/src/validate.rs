//! Record validation — rejected writes never reach the notification core.

use std::collections::HashSet;

use actiontrack_core::config::{TaxonomyConfig, TypeRegistry};
use actiontrack_core::error::{Result, TrackerError};
use actiontrack_core::traits::EntityStore;
use actiontrack_core::types::{Endpoint, EndpointKind, Entity, EntityKind, LinkId, LinkKind};

pub struct Validator<'a> {
    store: &'a dyn EntityStore,
    types: &'a TypeRegistry,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a dyn EntityStore, types: &'a TypeRegistry) -> Self {
        Self { store, types }
    }

    /// Validate an entity about to be saved.
    pub fn entity(&self, entity: &Entity) -> Result<()> {
        if entity.title.trim().is_empty() {
            return Err(TrackerError::validation("title", "can't be blank"));
        }
        self.entity_type(entity)?;
        self.parent(entity)
    }

    fn entity_type(&self, entity: &Entity) -> Result<()> {
        match entity.kind {
            EntityKind::Measure => match entity.type_id {
                None => Err(TrackerError::validation("measuretype_id", "can't be blank")),
                Some(id) if self.types.measure_type(id).is_none() => {
                    Err(TrackerError::validation("measuretype", "must exist"))
                }
                Some(_) => Ok(()),
            },
            EntityKind::Actor => match entity.type_id {
                None => Err(TrackerError::validation("actortype_id", "can't be blank")),
                Some(id) if self.types.actor_type(id).is_none() => {
                    Err(TrackerError::validation("actortype", "must exist"))
                }
                Some(_) => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn parent(&self, entity: &Entity) -> Result<()> {
        let Some(parent_id) = entity.parent_id else {
            return Ok(());
        };
        if !entity.kind.supports_parent() {
            return Err(TrackerError::validation("parent_id", "is not allowed for this kind"));
        }
        if parent_id == entity.id {
            return Err(TrackerError::validation("parent_id", "can't be the same as id"));
        }
        let parent = match self.store.entity(parent_id)? {
            Some(p) if p.kind == entity.kind => p,
            _ => {
                return Err(TrackerError::validation(
                    "parent_id",
                    &format!("must reference an existing {}", entity.kind),
                ));
            }
        };
        if entity.kind == EntityKind::Measure {
            let allowed = parent
                .type_id
                .and_then(|id| self.types.measure_type(id))
                .is_some_and(|t| t.has_parent);
            if !allowed {
                return Err(TrackerError::validation(
                    "parent_id",
                    "is not allowed for this measuretype",
                ));
            }
        }

        // Walk up from the new parent; meeting ourselves means a cycle.
        let mut seen = HashSet::new();
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node.id == entity.id {
                return Err(TrackerError::validation(
                    "parent_id",
                    "can't be its own descendant",
                ));
            }
            if !seen.insert(node.id) {
                break;
            }
            cursor = match node.parent_id {
                Some(id) => self.store.entity(id)?,
                None => None,
            };
        }
        Ok(())
    }

    /// Validate a link about to be inserted (or `existing` re-pointed).
    pub fn link(
        &self,
        kind: LinkKind,
        left: Endpoint,
        right: Endpoint,
        existing: Option<LinkId>,
    ) -> Result<()> {
        let (left_field, right_field) = kind.field_names();
        let (left_kind, right_kind) = kind.endpoint_kinds();
        let left_entity = self.endpoint(left, left_kind, left_field)?;
        let right_entity = self.endpoint(right, right_kind, right_field)?;

        if left == right {
            return Err(TrackerError::validation(
                left_field,
                &format!("can't be the same as {right_field}"),
            ));
        }

        if let Some(dup) = self.store.find_link(kind, left, right)?
            && Some(dup.id) != existing
        {
            return Err(TrackerError::validation(
                &format!("{left_field}_id"),
                "has already been taken",
            ));
        }

        match (kind, left_entity, right_entity) {
            (LinkKind::MeasureActor, Some(measure), Some(actor)) => {
                self.measure_actor(&measure, &actor)
            }
            (LinkKind::ActorCategory, Some(actor), Some(category)) => {
                let enabled = self
                    .taxonomy_of(&category)
                    .is_some_and(|t| actor.type_id.is_some_and(|id| t.actortype_ids.contains(&id)));
                if enabled {
                    Ok(())
                } else {
                    Err(TrackerError::validation(
                        "category",
                        "must have its taxonomy enabled for actor's actortype",
                    ))
                }
            }
            (LinkKind::MeasureCategory, Some(measure), Some(category)) => {
                let enabled = self.taxonomy_of(&category).is_some_and(|t| {
                    measure.type_id.is_some_and(|id| t.measuretype_ids.contains(&id))
                });
                if enabled {
                    Ok(())
                } else {
                    Err(TrackerError::validation(
                        "category",
                        "must have its taxonomy enabled for measure's measuretype",
                    ))
                }
            }
            _ => Ok(()),
        }
    }

    fn measure_actor(&self, measure: &Entity, actor: &Entity) -> Result<()> {
        let is_target = actor
            .type_id
            .and_then(|id| self.types.actor_type(id))
            .is_some_and(|t| t.is_target);
        if !is_target {
            return Err(TrackerError::validation(
                "actor",
                "actor's actortype is not target",
            ));
        }
        let has_target = measure
            .type_id
            .and_then(|id| self.types.measure_type(id))
            .is_some_and(|t| t.has_target);
        if !has_target {
            return Err(TrackerError::validation(
                "measure",
                "measure's measuretype can't have target",
            ));
        }
        Ok(())
    }

    fn taxonomy_of(
        &self,
        category: &Entity,
    ) -> Option<&'a TaxonomyConfig> {
        category.type_id.and_then(|id| self.types.taxonomy(id))
    }

    /// Check an endpoint exists and has the right kind; returns the entity
    /// for entity endpoints.
    fn endpoint(
        &self,
        endpoint: Endpoint,
        expected: EndpointKind,
        field: &str,
    ) -> Result<Option<Entity>> {
        match (endpoint, expected) {
            (Endpoint::User(id), EndpointKind::User) => match self.store.user(id)? {
                Some(_) => Ok(None),
                None => Err(TrackerError::validation(field, "must exist")),
            },
            (Endpoint::Entity(id), EndpointKind::Entity(kind)) => match self.store.entity(id)? {
                Some(e) if e.kind == kind => Ok(Some(e)),
                Some(_) => Err(TrackerError::validation(field, &format!("must be of kind {kind}"))),
                None => Err(TrackerError::validation(field, "must exist")),
            },
            (_, EndpointKind::User) => Err(TrackerError::validation(field, "must be a user")),
            (_, EndpointKind::Entity(kind)) => {
                Err(TrackerError::validation(field, &format!("must be of kind {kind}")))
            }
        }
    }
}
