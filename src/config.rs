// src/config.rs

//! Declarative pipeline definition.
//!
//! A run is described by staging relations, dimension specs and fact specs;
//! the builders compile these into store statements instead of carrying
//! hand-written SQL per table.

use crate::error::{EtlError, Result};
use crate::store::RelationName;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

fn default_staging_schema() -> String {
    "stage".into()
}

fn default_warehouse_schema() -> String {
    "star".into()
}

fn default_chunk_size() -> usize {
    1_000
}

fn default_delimiter() -> char {
    ','
}

fn default_encoding() -> String {
    "utf-8".into()
}

fn default_surrogate_key() -> String {
    "id".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_staging_schema")]
    pub staging_schema: String,
    #[serde(default = "default_warehouse_schema")]
    pub warehouse_schema: String,
    /// Rows per bulk-insert chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub downloads: Vec<DownloadSpec>,
    #[serde(default)]
    pub staging: Vec<StagingSpec>,
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    #[serde(default)]
    pub facts: Vec<FactSpec>,
}

/// A remote archive to fetch before staging.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadSpec {
    pub url: String,
    pub dest: PathBuf,
    /// Extract `.csv` entries next to the archive.
    #[serde(default)]
    pub extract: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceSpec {
    /// File path or glob; `.zip` archives are read entry by entry.
    pub path: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Stop after this many records across all matched files.
    #[serde(default)]
    pub max_rows: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagingSpec {
    pub name: String,
    pub source: SourceSpec,
    /// Stage every header column, not only the declared ones.
    #[serde(default)]
    pub include_all_columns: bool,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    /// Collapse duplicate rows after loading.
    #[serde(default)]
    pub distinct: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub transform: Transform,
    /// Characters removed from the raw text before transforming.
    #[serde(default)]
    pub strip: Option<String>,
}

/// Scalar transform applied to one staging column.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Transform {
    /// Trimmed text; empty becomes null.
    #[default]
    Text,
    Number {
        #[serde(default)]
        decimal_comma: bool,
    },
    Integer,
    /// `$1,200.50` style amounts.
    Currency,
    /// `87%` style rates.
    Percent,
    /// Truthy token ⇒ 1, anything else (null included) ⇒ 0.
    Flag {
        #[serde(default = "default_truthy")]
        truthy: Vec<String>,
    },
    Date {
        #[serde(default)]
        formats: Vec<String>,
    },
}

fn default_truthy() -> Vec<String> {
    vec!["t".into()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DimensionSpec {
    pub name: String,
    /// Staging relation the natural keys are projected from.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub natural_key_columns: Vec<String>,
    #[serde(default = "default_surrogate_key")]
    pub surrogate_key_name: String,
    /// Generate a calendar instead of projecting staging content.
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Leave out tuples whose key columns are all null.
    #[serde(default)]
    pub skip_null_keys: bool,
}

impl DimensionSpec {
    pub fn is_date_dimension(&self) -> bool {
        self.date_range.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FactSpec {
    pub name: String,
    pub source: FactSource,
    pub dimensions: Vec<DimensionRef>,
    #[serde(default)]
    pub degenerate: Vec<DegenerateColumn>,
    /// Apply DISTINCT over the projected fact row.
    #[serde(default)]
    pub dedup: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FactSource {
    pub relation: String,
    #[serde(default)]
    pub joins: Vec<SourceJoin>,
}

impl FactSource {
    /// Every staging relation the fact reads.
    pub fn relations(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.relation.as_str()).chain(self.joins.iter().map(|j| j.relation.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceJoin {
    pub relation: String,
    #[serde(default)]
    pub kind: JoinKind,
    /// Pairs of `[left column, right column]`; the left side may be qualified.
    pub on: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DimensionRef {
    pub dimension: String,
    /// Source columns matched position by position against the natural key.
    /// A date dimension takes a single date column.
    pub columns: Vec<String>,
    /// Foreign key column name in the fact relation.
    #[serde(default)]
    pub column: Option<String>,
    /// Unresolved rows keep a NULL key instead of being dropped.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DegenerateColumn {
    pub column: String,
    #[serde(default, rename = "as")]
    pub alias: Option<String>,
}

impl DegenerateColumn {
    pub fn output_name(&self) -> &str {
        self.alias
            .as_deref()
            .unwrap_or_else(|| self.column.rsplit('.').next().unwrap_or(&self.column))
    }
}

impl PipelineConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: PipelineConfig =
            serde_yaml::from_str(text).map_err(|e| EtlError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| EtlError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn staging_relation(&self, name: &str) -> RelationName {
        RelationName::new(Some(&self.staging_schema), name)
    }

    pub fn warehouse_relation(&self, name: &str) -> RelationName {
        RelationName::new(Some(&self.warehouse_schema), name)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionSpec> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    /// Foreign key column name a fact uses for `dim_ref`.
    pub fn foreign_key_column(&self, dim_ref: &DimensionRef) -> String {
        if let Some(col) = &dim_ref.column {
            return col.clone();
        }
        let key = self
            .dimension(&dim_ref.dimension)
            .map(|d| d.surrogate_key_name.as_str())
            .unwrap_or("id");
        format!("{}_{}", dim_ref.dimension, key)
    }

    /// Reject definitions the builders cannot compile.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::Config("chunk_size must be positive".into()));
        }

        let mut names = HashSet::new();
        for name in self
            .staging
            .iter()
            .map(|s| &s.name)
            .chain(self.dimensions.iter().map(|d| &d.name))
            .chain(self.facts.iter().map(|f| &f.name))
        {
            if !names.insert(name.as_str()) {
                return Err(EtlError::Config(format!("relation {} declared twice", name)));
            }
        }

        let staged: HashSet<&str> = self.staging.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.staging {
            if stage.columns.is_empty() && !stage.include_all_columns {
                return Err(EtlError::Config(format!(
                    "staging {} declares no columns and does not include all columns",
                    stage.name
                )));
            }
            if !stage.source.delimiter.is_ascii() {
                return Err(EtlError::Config(format!(
                    "staging {}: delimiter must be a single ASCII character",
                    stage.name
                )));
            }
        }

        let mut key_widths: HashMap<&str, usize> = HashMap::new();
        for dim in &self.dimensions {
            match (&dim.source, &dim.date_range) {
                (Some(_), Some(_)) => {
                    return Err(EtlError::Config(format!(
                        "dimension {} has both a staging source and a date range",
                        dim.name
                    )))
                }
                (None, None) => {
                    return Err(EtlError::Config(format!(
                        "dimension {} needs a staging source or a date range",
                        dim.name
                    )))
                }
                (Some(source), None) => {
                    if !staged.contains(source.as_str()) {
                        return Err(EtlError::Config(format!(
                            "dimension {} reads unknown staging relation {}",
                            dim.name, source
                        )));
                    }
                    if dim.natural_key_columns.is_empty() {
                        return Err(EtlError::Config(format!(
                            "dimension {} has an empty natural key",
                            dim.name
                        )));
                    }
                    if dim
                        .natural_key_columns
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(&dim.surrogate_key_name))
                    {
                        return Err(EtlError::Config(format!(
                            "dimension {}: surrogate key {} collides with a natural key column",
                            dim.name, dim.surrogate_key_name
                        )));
                    }
                    key_widths.insert(dim.name.as_str(), dim.natural_key_columns.len());
                }
                (None, Some(range)) => {
                    if range.start > range.end {
                        return Err(EtlError::Config(format!(
                            "dimension {}: date range starts after it ends",
                            dim.name
                        )));
                    }
                    key_widths.insert(dim.name.as_str(), 1);
                }
            }
        }

        for fact in &self.facts {
            for rel in fact.source.relations() {
                if !staged.contains(rel) {
                    return Err(EtlError::Config(format!(
                        "fact {} reads unknown staging relation {}",
                        fact.name, rel
                    )));
                }
            }
            if fact.dimensions.is_empty() {
                return Err(EtlError::Config(format!(
                    "fact {} references no dimensions",
                    fact.name
                )));
            }
            let mut fk_names = HashSet::new();
            for dim_ref in &fact.dimensions {
                let width = key_widths.get(dim_ref.dimension.as_str()).ok_or_else(|| {
                    EtlError::Config(format!(
                        "fact {} references unknown dimension {}",
                        fact.name, dim_ref.dimension
                    ))
                })?;
                if dim_ref.columns.len() != *width {
                    return Err(EtlError::Config(format!(
                        "fact {}: {} expects {} key column(s), got {}",
                        fact.name,
                        dim_ref.dimension,
                        width,
                        dim_ref.columns.len()
                    )));
                }
                if !fk_names.insert(self.foreign_key_column(dim_ref)) {
                    return Err(EtlError::Config(format!(
                        "fact {}: duplicate foreign key column {}",
                        fact.name,
                        self.foreign_key_column(dim_ref)
                    )));
                }
            }
            for degenerate in &fact.degenerate {
                if !fk_names.insert(degenerate.output_name().to_string()) {
                    return Err(EtlError::Config(format!(
                        "fact {}: column {} produced twice",
                        fact.name,
                        degenerate.output_name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
staging_schema: stg
chunk_size: 500
staging:
  - name: reestr
    source: { path: "data/tz_opendata_*.csv", delimiter: ";" }
    columns:
      - { name: PERSON }
      - { name: D_REG, transform: { kind: date } }
      - { name: CAPACITY, transform: { kind: number, decimal_comma: true } }
      - { name: VIN }
      - { name: N_REG_NEW }
dimensions:
  - { name: DimCustomer, source: reestr, natural_key_columns: [PERSON] }
  - { name: DimCarInfo, source: reestr, natural_key_columns: [VIN, CAPACITY] }
  - name: DimDate
    date_range: { start: 2012-01-01, end: 2040-12-31 }
facts:
  - name: MeasureCarProperties
    source: { relation: reestr }
    dedup: true
    dimensions:
      - { dimension: DimCustomer, columns: [PERSON], column: CUSTOMER_ID }
      - { dimension: DimCarInfo, columns: [VIN, CAPACITY] }
      - { dimension: DimDate, columns: [D_REG] }
    degenerate:
      - { column: N_REG_NEW }
"#;

    #[test]
    fn parses_registry_pipeline_with_defaults() {
        let cfg = PipelineConfig::from_yaml(REGISTRY).unwrap();
        assert_eq!(cfg.staging_schema, "stg");
        assert_eq!(cfg.warehouse_schema, "star");
        assert_eq!(cfg.chunk_size, 500);
        assert_eq!(cfg.staging[0].source.delimiter, ';');
        assert_eq!(cfg.staging[0].source.encoding, "utf-8");
        assert_eq!(
            cfg.staging[0].columns[2].transform,
            Transform::Number { decimal_comma: true }
        );
        assert_eq!(cfg.staging[0].columns[0].transform, Transform::Text);
        assert!(cfg.dimension("DimDate").unwrap().is_date_dimension());

        let fact = &cfg.facts[0];
        assert!(fact.dedup);
        assert_eq!(cfg.foreign_key_column(&fact.dimensions[0]), "CUSTOMER_ID");
        assert_eq!(cfg.foreign_key_column(&fact.dimensions[1]), "DimCarInfo_id");
        assert_eq!(fact.degenerate[0].output_name(), "N_REG_NEW");
    }

    #[test]
    fn flag_defaults_to_t_token() {
        let cfg = PipelineConfig::from_yaml(
            r#"
staging:
  - name: hosts
    source: { path: hosts.csv }
    columns:
      - { name: host_is_superhost, transform: { kind: flag } }
"#,
        )
        .unwrap();
        assert_eq!(
            cfg.staging[0].columns[0].transform,
            Transform::Flag { truthy: vec!["t".into()] }
        );
    }

    #[test]
    fn rejects_unknown_dimension_reference() {
        let text = REGISTRY.replace("dimension: DimCustomer,", "dimension: DimNope,");
        let err = PipelineConfig::from_yaml(&text).unwrap_err();
        assert!(matches!(err, EtlError::Config(ref m) if m.contains("DimNope")));
    }

    #[test]
    fn rejects_key_width_mismatch() {
        let text = REGISTRY.replace(
            "{ dimension: DimCarInfo, columns: [VIN, CAPACITY] }",
            "{ dimension: DimCarInfo, columns: [VIN] }",
        );
        let err = PipelineConfig::from_yaml(&text).unwrap_err();
        assert!(matches!(err, EtlError::Config(ref m) if m.contains("expects 2")));
    }

    #[test]
    fn rejects_dimension_with_both_sources() {
        let text = REGISTRY.replace(
            "    date_range: { start: 2012-01-01, end: 2040-12-31 }",
            "    source: reestr\n    natural_key_columns: [D_REG]\n    date_range: { start: 2012-01-01, end: 2040-12-31 }",
        );
        let err = PipelineConfig::from_yaml(&text).unwrap_err();
        assert!(matches!(err, EtlError::Config(ref m) if m.contains("both")));
    }

    #[test]
    fn demo_pipelines_validate() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");
        let airbnb = PipelineConfig::load(demos.join("airbnb.yaml")).unwrap();
        let rents = &airbnb.facts[0];
        assert_eq!(rents.source.relations().count(), 3);
        assert_eq!(rents.source.joins[1].kind, JoinKind::Left);

        let registry = PipelineConfig::load(demos.join("registry.yaml")).unwrap();
        assert_eq!(registry.downloads.len(), 3);
        assert_eq!(registry.staging[0].source.delimiter, ';');
    }

    #[test]
    fn rejects_duplicate_relation_names() {
        let text = REGISTRY.replace("name: DimCustomer", "name: reestr");
        assert!(PipelineConfig::from_yaml(&text).is_err());
    }
}
