//! Refresh: re-read a managed instance from the database.

use crate::cascade::{CascadeContext, CascadePoint, CascadingAction};
use crate::context::EntityStatus;
use crate::{BoxFuture, Session};
use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, Entity, Error, LockMode, try_outcome, try_result};

impl<C: Connection> Session<C> {
    /// Overwrite the state of a managed instance with its current row.
    pub async fn refresh(&mut self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        self.refresh_with_lock(cx, entity, LockMode::None).await
    }

    /// Refresh and acquire `lock` in the same SELECT.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = ?entity))]
    pub async fn refresh_with_lock(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        lock: LockMode,
    ) -> Outcome<(), Error> {
        try_result!(self.ensure_usable());
        let mut context = CascadeContext::new();
        self.refresh_inner(cx, entity.clone(), lock, &mut context).await
    }

    pub(crate) fn refresh_inner<'a>(
        &'a mut self,
        cx: &'a Cx,
        entity: Entity,
        lock: LockMode,
        context: &'a mut CascadeContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !context.visit(&entity) {
                return Outcome::Ok(());
            }
            if !entity.is_initialized() {
                return self.initialize_reference(cx, entity).await;
            }
            let Some(entry) = self.context.entry(&entity) else {
                return Outcome::Err(Error::IllegalArgument(format!(
                    "refreshing an unmanaged instance {:?}",
                    entity
                )));
            };
            match entry.status {
                EntityStatus::Managed | EntityStatus::ReadOnly => {}
                EntityStatus::Saving => {
                    return Outcome::Err(Error::IllegalArgument(format!(
                        "refreshing {:?} before its insert was flushed",
                        entity
                    )));
                }
                _ => {
                    return Outcome::Err(Error::IllegalArgument(format!(
                        "refreshing a removed instance {:?}",
                        entity
                    )));
                }
            }
            let persister = entry.persister.clone();
            let id = entry.id.clone();
            let read_only = entry.status == EntityStatus::ReadOnly;

            try_outcome!(
                self.cascade(
                    cx,
                    CascadingAction::Refresh,
                    CascadePoint::BeforeRefresh,
                    entity.clone(),
                    context
                )
                .await
            );

            if lock.is_pessimistic() {
                try_outcome!(self.begin_if_needed(cx).await);
            }
            let loaded = try_outcome!(
                self.load_entities(cx, persister, vec![id.clone()], lock, true)
                    .await
            );
            if !loaded.iter().any(|e| e.ptr_eq(&entity)) {
                return Outcome::Err(Error::ObjectNotFound {
                    entity: entity.entity_name(),
                    id: id.to_string(),
                });
            }
            if read_only {
                if let Some(entry) = self.context.entry_mut(&entity) {
                    entry.status = EntityStatus::ReadOnly;
                }
            }
            tracing::debug!(entity = ?entity, "Refreshed");
            Outcome::Ok(())
        })
    }
}
