// src/normalize/mod.rs

//! Field Normalizer: turns raw records into typed staging rows.

pub mod date_parser;
pub mod transforms;

use crate::config::{ColumnSpec, FilterOp, RowFilter, StagingSpec, Transform};
use crate::error::{EtlError, Result};
use crate::source::RawRecord;
use crate::store::{ColumnDef, Value};
use tracing::debug;

/// A staging column after schema resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingColumn {
    pub name: String,
    pub transform: Transform,
    pub strip: Option<String>,
}

impl From<&ColumnSpec> for StagingColumn {
    fn from(spec: &ColumnSpec) -> Self {
        Self {
            name: spec.name.clone(),
            transform: spec.transform.clone(),
            strip: spec.strip.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    relation: String,
    columns: Vec<StagingColumn>,
    filters: Vec<RowFilter>,
}

impl FieldNormalizer {
    pub fn new(relation: &str, columns: Vec<StagingColumn>, filters: Vec<RowFilter>) -> Self {
        Self {
            relation: relation.to_string(),
            columns,
            filters,
        }
    }

    /// Resolve the column list of a staging relation.
    ///
    /// With `include_all_columns` every source header is staged in header
    /// order (undeclared ones as text) and declared columns the headers lack
    /// are appended; otherwise exactly the declared columns, in order.
    pub fn for_staging(spec: &StagingSpec, source_headers: &[String]) -> Self {
        let declared: Vec<StagingColumn> = spec.columns.iter().map(StagingColumn::from).collect();

        let columns = if spec.include_all_columns {
            let mut cols: Vec<StagingColumn> = source_headers
                .iter()
                .map(|h| {
                    declared.iter().find(|c| &c.name == h).cloned().unwrap_or(StagingColumn {
                        name: h.clone(),
                        transform: Transform::Text,
                        strip: None,
                    })
                })
                .collect();
            for col in &declared {
                if !cols.iter().any(|c| c.name == col.name) {
                    cols.push(col.clone());
                }
            }
            cols
        } else {
            declared
        };

        let missing: Vec<&str> = columns
            .iter()
            .filter(|c| !source_headers.contains(&c.name))
            .map(|c| c.name.as_str())
            .collect();
        if !missing.is_empty() {
            debug!(relation = %spec.name, ?missing, "columns absent from every input, staged as null");
        }

        Self::new(&spec.name, columns, spec.filters.clone())
    }

    pub fn columns(&self) -> &[StagingColumn] {
        &self.columns
    }

    /// Staging relation definition.
    pub fn schema(&self) -> Vec<ColumnDef> {
        self.columns
            .iter()
            .map(|c| ColumnDef::new(&c.name, transforms::output_type(&c.transform)))
            .collect()
    }

    /// Row filters compare the trimmed raw text.
    pub fn accepts(&self, record: &RawRecord) -> bool {
        self.filters.iter().all(|f| {
            let raw = record.get(&f.column).map(str::trim);
            match f.op {
                FilterOp::Equals => raw == Some(f.value.as_str()),
                FilterOp::NotEquals => raw != Some(f.value.as_str()),
            }
        })
    }

    /// Normalize one record into a row matching [`Self::schema`].
    pub fn normalize(&self, record: &RawRecord) -> Result<Vec<Value>> {
        self.columns
            .iter()
            .map(|col| {
                let raw = record.get(&col.name);
                let cleaned = raw.map(|s| transforms::clean_str(s, col.strip.as_deref()));
                transforms::apply(&col.transform, cleaned.as_deref()).map_err(|reason| {
                    EtlError::Normalization {
                        relation: self.relation.clone(),
                        column: col.name.clone(),
                        row: record.row,
                        value: raw.unwrap_or_default().to_string(),
                        reason: format!("{} ({})", reason, record.origin),
                    }
                })
            })
            .collect()
    }

    /// Filter then normalize a record stream. The first error is yielded
    /// and the caller decides whether to stop.
    pub fn rows<'a, I>(&'a self, records: I) -> impl Iterator<Item = Result<Vec<Value>>> + 'a
    where
        I: IntoIterator<Item = Result<RawRecord>>,
        I::IntoIter: 'a,
    {
        records.into_iter().filter_map(move |rec| match rec {
            Ok(rec) if !self.accepts(&rec) => None,
            Ok(rec) => Some(self.normalize(&rec)),
            Err(e) => Some(Err(e)),
        })
    }
}
