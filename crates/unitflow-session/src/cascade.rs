//! The cascade engine.
//!
//! Walks the associations of one instance whose cascade style includes the current action and
//! hands every reachable instance to the matching event listener. Cycles are cut by the
//! per-operation [`CascadeContext`], which compares instances by reference identity.

use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use std::collections::{HashMap, HashSet};
use unitflow_core::{
    CascadeStyle, Connection, Entity, EntityIdentity, Error, LockMode, PropertyKind,
    PropertyValue, try_outcome, try_result,
};

/// Operation propagated along cascading associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadingAction {
    Persist,
    /// Persist of instances reached from managed ones at flush time.
    PersistOnFlush,
    Delete,
    Merge,
    Refresh,
    Lock(LockMode),
}

impl CascadingAction {
    /// Cascade style an association must carry to be followed.
    pub fn style(self) -> CascadeStyle {
        match self {
            CascadingAction::Persist | CascadingAction::PersistOnFlush => CascadeStyle::PERSIST,
            CascadingAction::Delete => CascadeStyle::REMOVE,
            CascadingAction::Merge => CascadeStyle::MERGE,
            CascadingAction::Refresh => CascadeStyle::REFRESH,
            CascadingAction::Lock(_) => CascadeStyle::LOCK,
        }
    }

    /// Must unloaded collections be initialized before cascading?
    pub fn requires_all_elements(self) -> bool {
        matches!(self, CascadingAction::Delete | CascadingAction::Merge)
    }

    pub fn deletes(self) -> bool {
        self == CascadingAction::Delete
    }
}

/// Where in the owner's processing the cascade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// Collections: children are handled before the owner's delete is scheduled and after its
    /// insert.
    AfterInsertBeforeDelete,
    /// To-one references: targets are handled before the owner's insert and after its delete.
    BeforeInsertAfterDelete,
    BeforeFlush,
    BeforeMerge,
    BeforeRefresh,
    AfterLock,
}

impl CascadePoint {
    pub fn includes_to_one(self) -> bool {
        self != CascadePoint::AfterInsertBeforeDelete
    }

    pub fn includes_collections(self) -> bool {
        self != CascadePoint::BeforeInsertAfterDelete
    }
}

/// Per-operation visited set and merge copies.
#[derive(Debug, Default)]
pub struct CascadeContext {
    visited: HashSet<EntityIdentity>,
    copies: HashMap<EntityIdentity, Entity>,
}

impl CascadeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `entity` visited; `false` if it already was.
    pub fn visit(&mut self, entity: &Entity) -> bool {
        self.visited.insert(entity.identity())
    }

    pub fn is_visited(&self, entity: &Entity) -> bool {
        self.visited.contains(&entity.identity())
    }

    /// Managed copy a merge produced for `source`.
    pub fn copy_of(&self, source: &Entity) -> Option<&Entity> {
        self.copies.get(&source.identity())
    }

    pub fn record_copy(&mut self, source: &Entity, copy: Entity) {
        self.copies.insert(source.identity(), copy);
    }
}

impl<C: Connection> Session<C> {
    /// Cascade `action` from `entity` to the associations that apply at `point`.
    pub(crate) fn cascade<'a>(
        &'a mut self,
        cx: &'a Cx,
        action: CascadingAction,
        point: CascadePoint,
        entity: Entity,
        context: &'a mut CascadeContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !entity.is_initialized() {
                return Outcome::Ok(());
            }
            let persister = entity.persister();
            if !persister.has_cascade(action.style()) {
                return Outcome::Ok(());
            }
            tracing::trace!(entity = ?entity, ?action, ?point, "Cascading");
            for (index, property) in persister.properties().iter().enumerate() {
                if !property.cascade.contains(action.style()) {
                    continue;
                }
                match (&property.kind, try_result!(entity.property(index))) {
                    (PropertyKind::ToOne { .. }, PropertyValue::ToOne(Some(target)))
                        if point.includes_to_one() =>
                    {
                        if action.deletes() && !target.is_initialized() {
                            try_outcome!(self.initialize_reference(cx, target.clone()).await);
                        }
                        try_outcome!(self.cascade_to(cx, action, target, context).await);
                    }
                    (PropertyKind::Collection(_), PropertyValue::Collection(collection))
                        if point.includes_collections() =>
                    {
                        if !collection.is_initialized() {
                            if !action.requires_all_elements() {
                                continue;
                            }
                            try_outcome!(self.initialize_collection(cx, collection.clone()).await);
                        }
                        for element in try_result!(collection.elements()) {
                            try_outcome!(self.cascade_to(cx, action, element, context).await);
                        }
                    }
                    _ => {}
                }
            }
            Outcome::Ok(())
        })
    }

    /// Hand one reachable instance to the listener of `action`.
    async fn cascade_to(
        &mut self,
        cx: &Cx,
        action: CascadingAction,
        target: Entity,
        context: &mut CascadeContext,
    ) -> Outcome<(), Error> {
        match action {
            CascadingAction::Persist | CascadingAction::PersistOnFlush => {
                self.persist_inner(cx, target, context).await
            }
            CascadingAction::Delete => self.delete_inner(cx, target, context, false).await,
            CascadingAction::Merge => {
                try_outcome!(self.merge_inner(cx, target, context).await);
                Outcome::Ok(())
            }
            CascadingAction::Refresh => {
                self.refresh_inner(cx, target, LockMode::None, context).await
            }
            CascadingAction::Lock(mode) => self.lock_inner(cx, target, mode, context).await,
        }
    }
}
