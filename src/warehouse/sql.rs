// src/warehouse/sql.rs

//! Query text fragments shared by the builders.

use crate::error::{EtlError, Result};
use crate::store::quote_ident;

/// `"alias"."column"`
pub fn column(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

/// Comma-separated quoted identifiers.
pub fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// NULL-safe equality: two NULLs compare equal.
pub fn null_safe_eq(left: &str, right: &str) -> String {
    format!("{} IS NOT DISTINCT FROM {}", left, right)
}

/// `ORDER BY` list with nulls sorted after every concrete value.
pub fn order_nulls_last<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| format!("{} NULLS LAST", quote_ident(n.as_ref())))
        .collect::<Vec<_>>()
        .join(", ")
}

/// True when every listed column is NULL.
pub fn all_null<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| format!("{} IS NULL", quote_ident(n.as_ref())))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Match a date dimension row against a date or date-like text expression.
pub fn date_parts_eq(date_expr: &str, dim_alias: &str) -> String {
    let cast = format!("TRY_CAST({} AS DATE)", date_expr);
    ["year", "month", "day"]
        .iter()
        .map(|part| format!("{} = {}({})", column(dim_alias, part), part, cast))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// A column reference inside a (possibly pre-joined) fact source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub relation: String,
    pub column: String,
}

impl ColumnRef {
    /// Resolve `relation.column` or a bare `column`; bare names belong to
    /// `default_relation`. Only relations in `known` may be named.
    pub fn resolve(reference: &str, default_relation: &str, known: &[&str]) -> Result<Self> {
        if let Some((rel, col)) = reference.split_once('.') {
            if known.contains(&rel) {
                return Ok(Self {
                    relation: rel.to_string(),
                    column: col.to_string(),
                });
            }
            return Err(EtlError::Config(format!(
                "column {} names relation {} which is not part of the fact source",
                reference, rel
            )));
        }
        Ok(Self {
            relation: default_relation.to_string(),
            column: reference.to_string(),
        })
    }

    pub fn sql(&self) -> String {
        column(&self.relation, &self.column)
    }
}
