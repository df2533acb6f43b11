// src/stage/mod.rs

//! Staging Sink: full-refresh loads of normalized rows.
//!
//! Rows are appended in chunks to a loading relation next to the target;
//! only once the whole stream is in does a single transaction replace the
//! target with it. A failed load leaves the previous version untouched.

use crate::config::{PipelineConfig, StagingSpec};
use crate::error::{EtlError, Result};
use crate::normalize::FieldNormalizer;
use crate::source::RecordSource;
use crate::store::{create_table_sql, ColumnDef, RelationName, RelationalStore, Value};
use tracing::{debug, error, info, instrument, warn};

const LOADING_SUFFIX: &str = "__loading";

pub struct StagingSink<'s, S: RelationalStore> {
    store: &'s S,
    chunk_size: usize,
}

impl<'s, S: RelationalStore> StagingSink<'s, S> {
    pub fn new(store: &'s S, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Replace `relation` with `rows`. Returns the committed row count.
    #[instrument(level = "info", skip(self, relation, schema, rows), fields(relation = %relation))]
    pub fn write<I>(
        &self,
        relation: &RelationName,
        schema: &[ColumnDef],
        rows: I,
        distinct: bool,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Vec<Value>>>,
    {
        if let Some(s) = &relation.schema {
            self.store.ensure_schema(s)?;
        }
        let loading = relation.sibling(&format!("{}{}", relation.name, LOADING_SUFFIX));
        self.store.drop_relation(&loading)?;
        self.store.execute_batch(&create_table_sql(&loading, schema))?;

        let appended = match self.append_chunks(&loading, rows) {
            Ok(n) => n,
            Err(e) => {
                warn!(relation = %relation, error = %e, "staging load failed, keeping previous version");
                if let Err(de) = self.store.drop_relation(&loading) {
                    warn!(relation = %loading, error = %de, "could not drop loading relation");
                }
                return Err(e);
            }
        };

        self.swap(&loading, relation, distinct)?;
        let committed = self.store.count(relation)?;
        info!(relation = %relation, appended, rows = committed, distinct, "staged");
        Ok(committed)
    }

    fn append_chunks<I>(&self, loading: &RelationName, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Vec<Value>>>,
    {
        let mut buf: Vec<Vec<Value>> = Vec::with_capacity(self.chunk_size);
        let mut total = 0u64;
        let mut chunk = 0usize;
        for row in rows {
            buf.push(row?);
            if buf.len() == self.chunk_size {
                total += self.append(loading, &buf, chunk, total)?;
                chunk += 1;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            total += self.append(loading, &buf, chunk, total)?;
        }
        Ok(total)
    }

    fn append(&self, loading: &RelationName, buf: &[Vec<Value>], chunk: usize, offset: u64) -> Result<u64> {
        match self.store.bulk_insert(loading, buf, self.chunk_size) {
            Ok(n) => {
                debug!(relation = %loading, chunk, rows = n, "appended chunk");
                Ok(n as u64)
            }
            Err(e) => {
                error!(relation = %loading, chunk, offset, error = %e, "chunk rejected");
                Err(EtlError::Chunk {
                    relation: loading.to_string(),
                    chunk,
                    offset,
                    source: Box::new(e),
                })
            }
        }
    }

    fn swap(&self, loading: &RelationName, target: &RelationName, distinct: bool) -> Result<()> {
        let select = if distinct { "SELECT DISTINCT *" } else { "SELECT *" };
        let statements = format!(
            "DROP TABLE IF EXISTS {target}; CREATE TABLE {target} AS {select} FROM {loading}; DROP TABLE {loading};",
            target = target.qualified(),
            loading = loading.qualified(),
        );

        self.store.begin()?;
        if let Err(e) = self.store.execute_batch(&statements) {
            if let Err(rb) = self.store.rollback() {
                error!(relation = %target, error = %rb, "rollback failed");
            }
            if let Err(de) = self.store.drop_relation(loading) {
                warn!(relation = %loading, error = %de, "could not drop loading relation");
            }
            return Err(e);
        }
        self.store.commit()
    }
}

/// Read, normalize and stage one configured relation.
pub fn load_staging<S: RelationalStore>(
    store: &S,
    config: &PipelineConfig,
    spec: &StagingSpec,
) -> Result<u64> {
    let source = RecordSource::new(&spec.source)?;
    let headers = source.headers()?;
    let normalizer = FieldNormalizer::for_staging(spec, &headers);
    let relation = config.staging_relation(&spec.name);

    StagingSink::new(store, config.chunk_size).write(
        &relation,
        &normalizer.schema(),
        normalizer.rows(source.open()),
        spec.distinct,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duck::DuckStore;
    use crate::error::EtlError;
    use crate::store::SqlType;
    use anyhow::Result;
    use std::cell::Cell;
    use std::fs;

    /// DuckDB with switchable failures in bulk inserts and in the swap.
    struct Flaky {
        inner: DuckStore,
        bulk_calls: Cell<usize>,
        fail_bulk_at: Option<usize>,
        fail_swap: bool,
    }

    impl Flaky {
        fn new(inner: DuckStore) -> Self {
            Self {
                inner,
                bulk_calls: Cell::new(0),
                fail_bulk_at: None,
                fail_swap: false,
            }
        }
    }

    impl RelationalStore for Flaky {
        fn ping(&self) -> crate::error::Result<()> {
            self.inner.ping()
        }
        fn execute(&self, sql: &str) -> crate::error::Result<usize> {
            self.inner.execute(sql)
        }
        fn execute_batch(&self, sql: &str) -> crate::error::Result<()> {
            if self.fail_swap && sql.contains("AS SELECT") {
                return Err(EtlError::Connectivity("swap interrupted".into()));
            }
            if self.fail_swap && sql.starts_with("ROLLBACK") {
                self.inner.execute_batch(sql)?;
                return Err(EtlError::Connectivity("rollback interrupted".into()));
            }
            self.inner.execute_batch(sql)
        }
        fn bulk_insert(&self, rel: &RelationName, rows: &[Vec<Value>], chunk: usize) -> crate::error::Result<usize> {
            let call = self.bulk_calls.get();
            self.bulk_calls.set(call + 1);
            if self.fail_bulk_at == Some(call) {
                return Err(EtlError::Connectivity("appender closed".into()));
            }
            self.inner.bulk_insert(rel, rows, chunk)
        }
        fn relation_exists(&self, rel: &RelationName) -> crate::error::Result<bool> {
            self.inner.relation_exists(rel)
        }
        fn describe(&self, rel: &RelationName) -> crate::error::Result<Option<Vec<ColumnDef>>> {
            self.inner.describe(rel)
        }
        fn query(&self, sql: &str) -> crate::error::Result<Vec<Vec<Value>>> {
            self.inner.query(sql)
        }
    }

    fn schema() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("city", SqlType::Text),
            ColumnDef::new("price", SqlType::Double),
        ]
    }

    fn rows(data: &[(&str, f64)]) -> Vec<crate::error::Result<Vec<Value>>> {
        data.iter()
            .map(|(c, p)| Ok(vec![Value::Text(c.to_string()), Value::Float(*p)]))
            .collect()
    }

    fn dump(store: &DuckStore, rel: &RelationName) -> Result<Vec<Vec<Value>>> {
        Ok(store.query(&format!(
            "SELECT city, price FROM {} ORDER BY city, price",
            rel.qualified()
        ))?)
    }

    #[test]
    fn writing_twice_replaces_instead_of_appending() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let rel = RelationName::new(Some("stage"), "listing_stage");
        let sink = StagingSink::new(&store, 2);
        let input = [("Kyiv", 10.0), ("Lviv", 20.0), ("Odesa", 30.0)];

        assert_eq!(sink.write(&rel, &schema(), rows(&input), false)?, 3);
        let first = dump(&store, &rel)?;
        assert_eq!(sink.write(&rel, &schema(), rows(&input), false)?, 3);
        assert_eq!(dump(&store, &rel)?, first);
        assert!(!store.relation_exists(&rel.sibling("listing_stage__loading"))?);
        Ok(())
    }

    #[test]
    fn failed_stream_keeps_previous_version() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let rel = RelationName::new(Some("stage"), "listing_stage");
        let sink = StagingSink::new(&store, 1);
        sink.write(&rel, &schema(), rows(&[("Kyiv", 10.0)]), false)?;

        let mut broken = rows(&[("Lviv", 20.0), ("Odesa", 30.0)]);
        broken.push(Err(EtlError::SourceRead {
            path: "listings.csv".into(),
            reason: "truncated".into(),
        }));
        assert!(sink.write(&rel, &schema(), broken, false).is_err());

        assert_eq!(
            dump(&store, &rel)?,
            vec![vec![Value::Text("Kyiv".into()), Value::Float(10.0)]]
        );
        Ok(())
    }

    #[test]
    fn rejected_chunk_is_identified_and_previous_version_kept() -> Result<()> {
        let mut store = Flaky::new(DuckStore::in_memory()?);
        let rel = RelationName::new(Some("stage"), "listing_stage");
        StagingSink::new(&store, 2).write(&rel, &schema(), rows(&[("Kyiv", 10.0)]), false)?;

        store.bulk_calls.set(0);
        store.fail_bulk_at = Some(1);
        let input = [("Lviv", 20.0), ("Odesa", 30.0), ("Rivne", 40.0), ("Sumy", 50.0)];
        let err = StagingSink::new(&store, 2)
            .write(&rel, &schema(), rows(&input), false)
            .unwrap_err();
        assert!(matches!(err, EtlError::Chunk { chunk: 1, offset: 2, .. }), "{}", err);
        assert_eq!(err.kind(), "ConnectivityError");

        assert_eq!(
            dump(&store.inner, &rel)?,
            vec![vec![Value::Text("Kyiv".into()), Value::Float(10.0)]]
        );
        assert!(!store.relation_exists(&rel.sibling("listing_stage__loading"))?);
        Ok(())
    }

    #[test]
    fn failed_rollback_does_not_hide_the_swap_error() -> Result<()> {
        let mut store = Flaky::new(DuckStore::in_memory()?);
        store.fail_swap = true;
        let rel = RelationName::new(Some("stage"), "listing_stage");
        let err = StagingSink::new(&store, 2)
            .write(&rel, &schema(), rows(&[("Kyiv", 10.0)]), false)
            .unwrap_err();
        assert!(matches!(err, EtlError::Connectivity(ref m) if m == "swap interrupted"));
        assert!(!store.relation_exists(&rel)?);
        Ok(())
    }

    #[test]
    fn distinct_collapses_duplicate_rows() -> Result<()> {
        let store = DuckStore::in_memory()?;
        let rel = RelationName::new(Some("stage"), "hosts");
        let sink = StagingSink::new(&store, 1000);
        let n = sink.write(
            &rel,
            &schema(),
            rows(&[("Kyiv", 1.0), ("Kyiv", 1.0), ("Kyiv", 2.0)]),
            true,
        )?;
        assert_eq!(n, 2);
        Ok(())
    }

    #[test]
    fn loads_a_configured_csv_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let csv = dir.path().join("listings.csv");
        fs::write(&csv, "id,price,available\n1,\"$1,200.50\",t\n2,,t\n3,$0,f\n")?;

        let yaml = format!(
            r#"
chunk_size: 2
staging:
  - name: listing_stage
    source: {{ path: "{}" }}
    columns:
      - {{ name: id, transform: {{ kind: integer }} }}
      - {{ name: price, transform: {{ kind: currency }} }}
      - {{ name: available, transform: {{ kind: flag }} }}
"#,
            csv.display()
        );
        let config = PipelineConfig::from_yaml(&yaml)?;
        let store = DuckStore::in_memory()?;

        assert_eq!(load_staging(&store, &config, &config.staging[0])?, 3);
        let rel = config.staging_relation("listing_stage");
        let got = store.query(&format!(
            "SELECT id, price, available FROM {} ORDER BY id",
            rel.qualified()
        ))?;
        assert_eq!(
            got,
            vec![
                vec![Value::Int(1), Value::Float(1200.5), Value::Int(1)],
                vec![Value::Int(2), Value::Null, Value::Int(1)],
                vec![Value::Int(3), Value::Float(0.0), Value::Int(0)],
            ]
        );
        Ok(())
    }
}
