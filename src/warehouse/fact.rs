// src/warehouse/fact.rs

use super::{find_column, prepare_target, require_columns, sql};
use crate::config::{FactSpec, JoinKind, PipelineConfig};
use crate::error::{EtlError, Result};
use crate::store::{quote_ident, ColumnDef, RelationName, RelationalStore, SqlType};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Builds fact relations by resolving every source row to dimension
/// surrogate keys.
///
/// Required dimensions are inner-joined, so rows whose natural key does
/// not resolve are dropped. Optional ones are left-joined and keep a NULL
/// foreign key. A natural key that matches several dimension rows fans the
/// fact row out once per match.
pub struct FactBuilder<'s, S: RelationalStore> {
    store: &'s S,
    config: &'s PipelineConfig,
}

impl<'s, S: RelationalStore> FactBuilder<'s, S> {
    pub fn new(store: &'s S, config: &'s PipelineConfig) -> Self {
        Self { store, config }
    }

    #[instrument(level = "info", skip(self, spec), fields(fact = %spec.name, dedup = spec.dedup))]
    pub fn build(&self, spec: &FactSpec) -> Result<u64> {
        let target = self.config.warehouse_relation(&spec.name);
        let (columns, insert) = self.compile(spec)?;
        prepare_target(self.store, &target, &columns)?;

        debug!(fact = %target, sql = %insert, "compiled");
        self.store.execute(&insert)?;

        let rows = self.store.count(&target)?;
        info!(fact = %target, rows, "fact built");
        Ok(rows)
    }

    /// Target definition and `INSERT ... SELECT` for `spec`.
    pub fn compile(&self, spec: &FactSpec) -> Result<(Vec<ColumnDef>, String)> {
        let source = &spec.source;
        let relations: Vec<&str> = source.relations().collect();

        // staged column definitions per source relation, keyed by alias
        let mut staged: HashMap<&str, (RelationName, Vec<ColumnDef>)> = HashMap::new();
        for rel in &relations {
            let name = self.config.staging_relation(rel);
            let cols = require_columns(self.store, &name)?;
            staged.insert(*rel, (name, cols));
        }
        let resolve = |reference: &str| -> Result<(sql::ColumnRef, SqlType)> {
            let col = sql::ColumnRef::resolve(reference, &source.relation, &relations)?;
            let (name, cols) = staged
                .get(col.relation.as_str())
                .ok_or_else(|| EtlError::MissingRelation(col.relation.clone()))?;
            let ty = find_column(cols, name, &col.column)?.ty;
            Ok((col, ty))
        };

        let mut from = format!(
            "{} AS {}",
            self.config.staging_relation(&source.relation).qualified(),
            quote_ident(&source.relation)
        );
        for join in &source.joins {
            let mut on = Vec::with_capacity(join.on.len());
            for (left, right) in &join.on {
                let (left, _) = resolve(left)?;
                let right_col = right
                    .strip_prefix(&format!("{}.", join.relation))
                    .unwrap_or(right);
                let (right, _) = resolve(&format!("{}.{}", join.relation, right_col))?;
                on.push(format!("{} = {}", left.sql(), right.sql()));
            }
            from.push_str(&format!(
                " {} JOIN {} AS {} ON {}",
                join_sql(join.kind),
                self.config.staging_relation(&join.relation).qualified(),
                quote_ident(&join.relation),
                on.join(" AND ")
            ));
        }

        let mut columns = Vec::new();
        let mut select = Vec::new();
        for (idx, dim_ref) in spec.dimensions.iter().enumerate() {
            let dim = self.config.dimension(&dim_ref.dimension).ok_or_else(|| {
                EtlError::Config(format!(
                    "fact {} references unknown dimension {}",
                    spec.name, dim_ref.dimension
                ))
            })?;
            let alias = format!("dim_{}", idx);
            let kind = if dim_ref.optional {
                JoinKind::Left
            } else {
                JoinKind::Inner
            };

            let predicate = if dim.is_date_dimension() {
                let [date_col] = dim_ref.columns.as_slice() else {
                    return Err(EtlError::Config(format!(
                        "fact {}: date dimension {} takes one column",
                        spec.name, dim.name
                    )));
                };
                sql::date_parts_eq(&resolve(date_col)?.0.sql(), &alias)
            } else {
                let mut parts = Vec::with_capacity(dim_ref.columns.len());
                for (src, key) in dim_ref.columns.iter().zip(&dim.natural_key_columns) {
                    let (col, _) = resolve(src)?;
                    parts.push(sql::null_safe_eq(&col.sql(), &sql::column(&alias, key)));
                }
                parts.join(" AND ")
            };

            from.push_str(&format!(
                " {} JOIN {} AS {} ON {}",
                join_sql(kind),
                self.config.warehouse_relation(&dim.name).qualified(),
                quote_ident(&alias),
                predicate
            ));

            let fk = self.config.foreign_key_column(dim_ref);
            select.push(format!(
                "{} AS {}",
                sql::column(&alias, &dim.surrogate_key_name),
                quote_ident(&fk)
            ));
            columns.push(ColumnDef::new(&fk, SqlType::BigInt));
        }

        for degenerate in &spec.degenerate {
            let (col, ty) = resolve(&degenerate.column)?;
            let out = degenerate.output_name();
            select.push(format!("{} AS {}", col.sql(), quote_ident(out)));
            columns.push(ColumnDef::new(out, ty));
        }

        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let insert = format!(
            "INSERT INTO {} ({}) SELECT {}{} FROM {}",
            self.config.warehouse_relation(&spec.name).qualified(),
            sql::ident_list(&names),
            if spec.dedup { "DISTINCT " } else { "" },
            select.join(", "),
            from
        );
        Ok((columns, insert))
    }
}

fn join_sql(kind: JoinKind) -> &'static str {
    match kind {
        JoinKind::Inner => "INNER",
        JoinKind::Left => "LEFT",
    }
}
