// src/warehouse/dimension.rs

use super::{find_column, prepare_target, require_columns, sql};
use crate::config::{DateRange, DimensionSpec, PipelineConfig};
use crate::error::{EtlError, Result};
use crate::store::{ColumnDef, RelationName, RelationalStore, SqlType, Value};
use chrono::Datelike;
use tracing::{info, instrument};

/// Columns of a generated date dimension, after the surrogate key.
pub const DATE_DIMENSION_COLUMNS: [&str; 4] = ["date", "day", "month", "year"];

/// Builds dimension relations: one row per distinct natural-key tuple,
/// keyed by a generated surrogate.
///
/// Surrogate keys are `1..=n` in natural-key order with nulls last. That
/// order is deterministic but not part of the contract.
pub struct DimensionBuilder<'s, S: RelationalStore> {
    store: &'s S,
    config: &'s PipelineConfig,
}

impl<'s, S: RelationalStore> DimensionBuilder<'s, S> {
    pub fn new(store: &'s S, config: &'s PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Build the dimension `spec` describes. Returns its row count.
    pub fn build(&self, spec: &DimensionSpec) -> Result<u64> {
        let target = self.config.warehouse_relation(&spec.name);
        match (&spec.source, &spec.date_range) {
            (_, Some(range)) => self.build_date_dimension(&target, range, &spec.surrogate_key_name),
            (Some(source), None) => self.build_from_staging(
                &self.config.staging_relation(source),
                &spec.natural_key_columns,
                &target,
                &spec.surrogate_key_name,
                spec.skip_null_keys,
            ),
            (None, None) => Err(EtlError::Config(format!(
                "dimension {} has no source",
                spec.name
            ))),
        }
    }

    /// Project the distinct natural keys of `staging` into `target`.
    ///
    /// `SELECT DISTINCT` groups NULLs together, so `(a, NULL)` twice is one
    /// row while `(a, b)` and `(a, NULL)` stay apart.
    #[instrument(level = "info", skip(self, staging, natural_key_columns, target), fields(dimension = %target))]
    pub fn build_from_staging(
        &self,
        staging: &RelationName,
        natural_key_columns: &[String],
        target: &RelationName,
        surrogate_key: &str,
        skip_null_keys: bool,
    ) -> Result<u64> {
        let staged = require_columns(self.store, staging)?;
        let mut columns = vec![ColumnDef::primary_key(surrogate_key)];
        for key in natural_key_columns {
            let col = find_column(&staged, staging, key)?;
            columns.push(ColumnDef::new(&col.name, col.ty));
        }
        prepare_target(self.store, target, &columns)?;

        let keys = sql::ident_list(natural_key_columns);
        let filter = if skip_null_keys {
            format!(" WHERE NOT ({})", sql::all_null(natural_key_columns))
        } else {
            String::new()
        };
        let insert = format!(
            "INSERT INTO {target} ({sk}, {keys}) \
             SELECT row_number() OVER (ORDER BY {order}) AS {sk}, {keys} \
             FROM (SELECT DISTINCT {keys} FROM {staging}{filter}) AS natural_keys",
            target = target.qualified(),
            sk = crate::store::quote_ident(surrogate_key),
            keys = keys,
            order = sql::order_nulls_last(natural_key_columns),
            staging = staging.qualified(),
            filter = filter,
        );
        self.store.execute(&insert)?;

        let rows = self.store.count(target)?;
        info!(dimension = %target, source = %staging, rows, "dimension built");
        Ok(rows)
    }

    /// Fill `target` with one row per calendar day of `range`, inclusive.
    #[instrument(level = "info", skip(self, target, range), fields(dimension = %target, start = %range.start, end = %range.end))]
    pub fn build_date_dimension(
        &self,
        target: &RelationName,
        range: &DateRange,
        surrogate_key: &str,
    ) -> Result<u64> {
        let mut columns = vec![
            ColumnDef::primary_key(surrogate_key),
            ColumnDef::new(DATE_DIMENSION_COLUMNS[0], SqlType::Date),
        ];
        columns.extend(
            DATE_DIMENSION_COLUMNS[1..]
                .iter()
                .map(|c| ColumnDef::new(c, SqlType::BigInt)),
        );
        prepare_target(self.store, target, &columns)?;

        let rows: Vec<Vec<Value>> = range
            .start
            .iter_days()
            .take_while(|d| *d <= range.end)
            .enumerate()
            .map(|(i, d)| {
                vec![
                    Value::Int(i as i64 + 1),
                    Value::Date(d),
                    Value::Int(d.day() as i64),
                    Value::Int(d.month() as i64),
                    Value::Int(d.year() as i64),
                ]
            })
            .collect();
        self.store.bulk_insert(target, &rows, self.config.chunk_size)?;

        let rows = self.store.count(target)?;
        info!(dimension = %target, rows, "date dimension built");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duck::DuckStore;
    use crate::stage::StagingSink;
    use anyhow::Result;
    use chrono::NaiveDate;

    fn config() -> PipelineConfig {
        PipelineConfig::from_yaml("staging: []").unwrap()
    }

    fn text(s: Option<&str>) -> Value {
        s.map(|s| Value::Text(s.into())).unwrap_or(Value::Null)
    }

    fn stage_places(store: &DuckStore, rows: &[(Option<&str>, Option<&str>)]) -> Result<RelationName> {
        let rel = RelationName::new(Some("stage"), "places");
        let schema = vec![
            ColumnDef::new("city", SqlType::Text),
            ColumnDef::new("region", SqlType::Text),
        ];
        let rows = rows
            .iter()
            .map(|(c, r)| Ok(vec![text(*c), text(*r)]))
            .collect::<Vec<crate::error::Result<Vec<Value>>>>();
        StagingSink::new(store, 100).write(&rel, &schema, rows, false)?;
        Ok(rel)
    }

    fn keys() -> Vec<String> {
        vec!["city".into(), "region".into()]
    }

    fn target() -> RelationName {
        RelationName::new(Some("star"), "dim_place")
    }

    #[test]
    fn null_is_not_a_wildcard_but_groups_with_itself() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let staging = stage_places(
            &store,
            &[
                (Some("Kyiv"), Some("UA")),
                (Some("Kyiv"), None),
                (None, None),
                (None, None),
                (Some("Kyiv"), None),
            ],
        )?;

        let rows = DimensionBuilder::new(&store, &cfg)
            .build_from_staging(&staging, &keys(), &target(), "id", false)?;
        assert_eq!(rows, 3);

        let null_pairs = store.query(&format!(
            "SELECT count(*) FROM {} WHERE city IS NULL AND region IS NULL",
            target().qualified()
        ))?;
        assert_eq!(null_pairs[0][0], Value::Int(1));

        let ids = store.query(&format!(
            "SELECT count(DISTINCT id), min(id), max(id) FROM {}",
            target().qualified()
        ))?;
        assert_eq!(ids[0], vec![Value::Int(3), Value::Int(1), Value::Int(3)]);
        Ok(())
    }

    #[test]
    fn repeated_tuple_gets_a_single_surrogate() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let staging = stage_places(&store, &[(Some("Kyiv"), Some("UA")), (Some("Kyiv"), Some("UA"))])?;
        let builder = DimensionBuilder::new(&store, &cfg);

        assert_eq!(builder.build_from_staging(&staging, &keys(), &target(), "id", false)?, 1);
        let got = store.query(&format!("SELECT id, city, region FROM {}", target().qualified()))?;
        assert_eq!(
            got,
            vec![vec![Value::Int(1), Value::Text("Kyiv".into()), Value::Text("UA".into())]]
        );

        // a third distinct tuple adds exactly one row
        let staging = stage_places(
            &store,
            &[(Some("Kyiv"), Some("UA")), (Some("Kyiv"), Some("UA")), (Some("Lviv"), Some("UA"))],
        )?;
        assert_eq!(builder.build_from_staging(&staging, &keys(), &target(), "id", false)?, 2);
        Ok(())
    }

    #[test]
    fn skip_null_keys_leaves_out_all_null_tuples() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let staging = stage_places(&store, &[(None, None), (Some("Kyiv"), None)])?;
        let rows = DimensionBuilder::new(&store, &cfg)
            .build_from_staging(&staging, &keys(), &target(), "id", true)?;
        assert_eq!(rows, 1);
        Ok(())
    }

    #[test]
    fn incompatible_existing_dimension_is_a_conflict() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let staging = stage_places(&store, &[(Some("Kyiv"), Some("UA"))])?;
        store.ensure_schema("star")?;
        store.execute_batch(&format!(
            "CREATE TABLE {} (id BIGINT, city DOUBLE);",
            target().qualified()
        ))?;

        let err = DimensionBuilder::new(&store, &cfg)
            .build_from_staging(&staging, &keys(), &target(), "id", false)
            .unwrap_err();
        assert!(matches!(err, EtlError::SchemaConflict { .. }));
        // left as it was
        assert_eq!(store.describe(&target())?.map(|c| c.len()), Some(2));
        Ok(())
    }

    #[test]
    fn missing_staging_relation_is_reported() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let err = DimensionBuilder::new(&store, &cfg)
            .build_from_staging(
                &RelationName::new(Some("stage"), "nope"),
                &keys(),
                &target(),
                "id",
                false,
            )
            .unwrap_err();
        assert!(matches!(err, EtlError::MissingRelation(_)));
        Ok(())
    }

    #[test]
    fn date_dimension_covers_the_range_inclusively() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let cfg = config();
        let range = DateRange {
            start: NaiveDate::from_ymd_opt(2020, 2, 27).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
        };
        let target = RelationName::new(Some("star"), "DimDate");
        let builder = DimensionBuilder::new(&store, &cfg);

        assert_eq!(builder.build_date_dimension(&target, &range, "id")?, 4);
        let leap = store.query(&format!(
            "SELECT id, day, month, year FROM {} WHERE date = DATE '2020-02-29'",
            target.qualified()
        ))?;
        assert_eq!(
            leap,
            vec![vec![Value::Int(3), Value::Int(29), Value::Int(2), Value::Int(2020)]]
        );

        // rebuilding reloads rather than appending
        assert_eq!(builder.build_date_dimension(&target, &range, "id")?, 4);
        Ok(())
    }
}
