// src/warehouse/integrity.rs

//! Post-run checks over built relations: orphaned foreign keys in facts
//! and repeated natural keys in dimensions.

use super::sql;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::store::{quote_ident, RelationalStore, Value};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanCount {
    pub fact: String,
    pub column: String,
    pub dimension: String,
    pub orphans: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateKeys {
    pub dimension: String,
    /// Natural-key tuples held by more than one row.
    pub duplicated: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub orphans: Vec<OrphanCount>,
    pub duplicates: Vec<DuplicateKeys>,
    /// Relations that were expected but not found.
    pub missing: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.orphans.iter().all(|o| o.orphans == 0)
            && self.duplicates.iter().all(|d| d.duplicated == 0)
    }
}

fn scalar(rows: &[Vec<Value>]) -> u64 {
    rows.first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .unwrap_or(0) as u64
}

/// Check every configured dimension and fact that exists in the store.
pub fn verify<S: RelationalStore>(store: &S, config: &PipelineConfig) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();

    for dim in &config.dimensions {
        let rel = config.warehouse_relation(&dim.name);
        if !store.relation_exists(&rel)? {
            report.missing.push(rel.to_string());
            continue;
        }
        let keys: Vec<&str> = if dim.is_date_dimension() {
            vec!["date"]
        } else {
            dim.natural_key_columns.iter().map(String::as_str).collect()
        };
        // GROUP BY puts NULLs in one group, matching the builder's DISTINCT
        let duplicated = scalar(&store.query(&format!(
            "SELECT count(*) FROM (SELECT {keys} FROM {rel} GROUP BY {keys} HAVING count(*) > 1) AS d",
            keys = sql::ident_list(&keys),
            rel = rel.qualified(),
        ))?);
        if duplicated > 0 {
            warn!(dimension = %rel, duplicated, "natural key not unique");
        }
        report.duplicates.push(DuplicateKeys {
            dimension: rel.to_string(),
            duplicated,
        });
    }

    for fact in &config.facts {
        let rel = config.warehouse_relation(&fact.name);
        if !store.relation_exists(&rel)? {
            report.missing.push(rel.to_string());
            continue;
        }
        for dim_ref in &fact.dimensions {
            let Some(dim) = config.dimension(&dim_ref.dimension) else {
                continue;
            };
            let dim_rel = config.warehouse_relation(&dim.name);
            if !store.relation_exists(&dim_rel)? {
                continue;
            }
            let fk = config.foreign_key_column(dim_ref);
            let orphans = scalar(&store.query(&format!(
                "SELECT count(*) FROM {fact} AS f WHERE f.{fk} IS NOT NULL \
                 AND NOT EXISTS (SELECT 1 FROM {dim} AS d WHERE d.{sk} = f.{fk})",
                fact = rel.qualified(),
                dim = dim_rel.qualified(),
                fk = quote_ident(&fk),
                sk = quote_ident(&dim.surrogate_key_name),
            ))?);
            if orphans > 0 {
                warn!(fact = %rel, column = %fk, dimension = %dim_rel, orphans, "orphaned foreign keys");
            }
            report.orphans.push(OrphanCount {
                fact: rel.to_string(),
                column: fk,
                dimension: dim_rel.to_string(),
                orphans,
            });
        }
    }

    info!(
        clean = report.is_clean(),
        checked = report.orphans.len() + report.duplicates.len(),
        missing = report.missing.len(),
        "integrity verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duck::DuckStore;
    use anyhow::Result;

    const CONFIG: &str = r#"
staging:
  - { name: reestr, source: { path: r.csv }, columns: [{ name: COLOR }] }
dimensions:
  - { name: DimColor, source: reestr, natural_key_columns: [COLOR] }
facts:
  - name: MeasureColor
    source: { relation: reestr }
    dimensions: [{ dimension: DimColor, columns: [COLOR] }]
"#;

    fn seed(store: &DuckStore, fact_keys: &str) -> Result<()> {
        store.execute_batch(&format!(
            "CREATE SCHEMA star;
             CREATE TABLE star.\"DimColor\" (id BIGINT PRIMARY KEY, \"COLOR\" VARCHAR);
             INSERT INTO star.\"DimColor\" VALUES (1, 'RED'), (2, NULL);
             CREATE TABLE star.\"MeasureColor\" (\"DimColor_id\" BIGINT);
             INSERT INTO star.\"MeasureColor\" VALUES {};",
            fact_keys
        ))?;
        Ok(())
    }

    #[test]
    fn clean_warehouse_passes() -> Result<()> {
        let store = DuckStore::in_memory()?;
        seed(&store, "(1), (2), (1)")?;
        let report = verify(&store, &PipelineConfig::from_yaml(CONFIG)?)?;
        assert!(report.is_clean());
        assert_eq!(report.orphans[0].orphans, 0);
        Ok(())
    }

    #[test]
    fn orphans_are_counted() -> Result<()> {
        let store = DuckStore::in_memory()?;
        seed(&store, "(1), (7), (8), (NULL)")?;
        let report = verify(&store, &PipelineConfig::from_yaml(CONFIG)?)?;
        assert!(!report.is_clean());
        assert_eq!(report.orphans[0].orphans, 2);
        assert_eq!(report.orphans[0].column, "DimColor_id");
        Ok(())
    }

    #[test]
    fn repeated_natural_keys_are_counted() -> Result<()> {
        let store = DuckStore::in_memory()?;
        seed(&store, "(1), (2)")?;
        store.execute_batch("INSERT INTO star.\"DimColor\" VALUES (3, 'RED');")?;
        let report = verify(&store, &PipelineConfig::from_yaml(CONFIG)?)?;
        assert_eq!(report.duplicates[0].duplicated, 1);
        assert_eq!(report.orphans[0].orphans, 0);
        assert!(!report.is_clean());
        Ok(())
    }

    #[test]
    fn missing_relations_are_listed() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let report = verify(&store, &PipelineConfig::from_yaml(CONFIG)?)?;
        assert_eq!(report.missing, vec!["star.DimColor", "star.MeasureColor"]);
        assert!(!report.is_clean());
        Ok(())
    }
}
