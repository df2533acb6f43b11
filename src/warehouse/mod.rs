// src/warehouse/mod.rs

//! Dimension and fact materialization over staged relations.

pub mod dimension;
pub mod fact;
pub mod integrity;
pub mod sql;

pub use dimension::DimensionBuilder;
pub use fact::FactBuilder;
pub use integrity::{verify, IntegrityReport};

use crate::error::{EtlError, Result};
use crate::store::{create_table_sql, ColumnDef, RelationName, RelationalStore};
use tracing::debug;

/// Same column names (case-insensitive), order and type family.
pub fn compatible(existing: &[ColumnDef], expected: &[ColumnDef]) -> bool {
    existing.len() == expected.len()
        && existing
            .iter()
            .zip(expected)
            .all(|(a, b)| a.name.eq_ignore_ascii_case(&b.name) && a.ty == b.ty)
}

fn describe_columns(columns: &[ColumnDef]) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", c.name, c.ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Create `target` with `columns`, or empty it when a compatible
/// definition already exists. An incompatible one is a conflict.
pub(crate) fn prepare_target<S: RelationalStore>(
    store: &S,
    target: &RelationName,
    columns: &[ColumnDef],
) -> Result<()> {
    match store.describe(target)? {
        None => {
            if let Some(schema) = &target.schema {
                store.ensure_schema(schema)?;
            }
            store.execute_batch(&create_table_sql(target, columns))?;
            debug!(relation = %target, "created");
        }
        Some(existing) if compatible(&existing, columns) => {
            let removed = store.execute(&format!("DELETE FROM {}", target.qualified()))?;
            debug!(relation = %target, removed, "cleared existing rows");
        }
        Some(existing) => {
            return Err(EtlError::SchemaConflict {
                relation: target.to_string(),
                detail: format!(
                    "found ({}), expected ({})",
                    describe_columns(&existing),
                    describe_columns(columns)
                ),
            })
        }
    }
    Ok(())
}

/// Column definitions of a relation that must exist.
pub(crate) fn require_columns<S: RelationalStore>(
    store: &S,
    relation: &RelationName,
) -> Result<Vec<ColumnDef>> {
    store
        .describe(relation)?
        .ok_or_else(|| EtlError::MissingRelation(relation.to_string()))
}

pub(crate) fn find_column<'c>(
    columns: &'c [ColumnDef],
    relation: &RelationName,
    name: &str,
) -> Result<&'c ColumnDef> {
    columns.iter().find(|c| c.name == name).ok_or_else(|| {
        EtlError::Config(format!("relation {} has no column {}", relation, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duck::DuckStore;
    use crate::store::SqlType;

    #[test]
    fn compatibility_ignores_case_but_not_types() {
        let expected = vec![ColumnDef::primary_key("id"), ColumnDef::new("city", SqlType::Text)];
        let same = vec![ColumnDef::new("ID", SqlType::BigInt), ColumnDef::new("City", SqlType::Text)];
        let retyped = vec![ColumnDef::new("id", SqlType::BigInt), ColumnDef::new("city", SqlType::Double)];
        assert!(compatible(&same, &expected));
        assert!(!compatible(&retyped, &expected));
        assert!(!compatible(&expected[..1], &expected));
    }

    #[test]
    fn prepare_target_creates_clears_or_conflicts() -> anyhow::Result<()> {
        let store = DuckStore::in_memory()?;
        let target = RelationName::new(Some("star"), "dim_city");
        let cols = vec![ColumnDef::primary_key("id"), ColumnDef::new("city", SqlType::Text)];

        prepare_target(&store, &target, &cols)?;
        store.execute(&format!("INSERT INTO {} VALUES (1, 'Kyiv')", target.qualified()))?;
        prepare_target(&store, &target, &cols)?;
        assert_eq!(store.count(&target)?, 0);

        let other = vec![ColumnDef::primary_key("id"), ColumnDef::new("region", SqlType::Double)];
        let err = prepare_target(&store, &target, &other).unwrap_err();
        assert!(matches!(err, EtlError::SchemaConflict { .. }));
        Ok(())
    }
}
