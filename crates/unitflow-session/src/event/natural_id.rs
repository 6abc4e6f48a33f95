//! Resolve natural id: find an instance by its natural identifier.

use crate::Session;
use asupersync::{Cx, Outcome};
use unitflow_core::{Connection, Entity, Error, LockMode, Value, try_outcome, try_result};
use unitflow_query::PlanKind;
use unitflow_query::plan::natural_id_plan;

impl<C: Connection> Session<C> {
    /// Instance of `entity_name` whose natural-id properties equal `values`, in declaration
    /// order.
    ///
    /// Immutable natural ids resolve from the session cache when possible. Mutable ones flush
    /// pending changes to the entity's tables first.
    #[tracing::instrument(level = "debug", skip(self, cx, values))]
    pub async fn find_by_natural_id(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        values: &[Value],
    ) -> Outcome<Option<Entity>, Error> {
        try_result!(self.ensure_usable());
        let persister = try_result!(self.factory.persister(entity_name));
        if !persister.has_natural_id() {
            return Outcome::Err(Error::IllegalArgument(format!(
                "{} does not define a natural id",
                entity_name
            )));
        }
        if values.len() != persister.natural_id_indices().len() {
            return Outcome::Err(Error::IllegalArgument(format!(
                "{} natural id has {} properties, {} values given",
                entity_name,
                persister.natural_id_indices().len(),
                values.len()
            )));
        }

        let cached = if persister.is_natural_id_mutable() {
            None
        } else {
            self.context.natural_id_lookup(&persister, values).cloned()
        };
        let id = match cached {
            Some(id) => {
                tracing::trace!(entity = %entity_name, id = %id, "Natural id resolved from the session");
                id
            }
            None => {
                if persister.is_natural_id_mutable() {
                    let spaces = try_result!(self.factory.metamodel().query_spaces(entity_name));
                    try_outcome!(self.auto_flush(cx, &spaces).await);
                }
                let dialect = self.connection.dialect();
                let sql = try_result!(self.single_plan_sql(&persister, PlanKind::NaturalId, LockMode::None, || {
                    natural_id_plan(&persister, dialect)
                }));
                let row = try_outcome!(self.select_first(cx, &sql, values, "natural id resolution").await);
                match row.and_then(|r| r.get(0).cloned()) {
                    Some(id) if !id.is_null() => id,
                    _ => return Outcome::Ok(None),
                }
            }
        };
        self.find(cx, entity_name, id).await
    }
}
