// src/source/mod.rs

//! Record Source: a lazy, restartable stream of flat records read from
//! delimited text files, glob patterns of them, or `.csv` entries inside
//! `.zip` archives.

pub mod archive;

use crate::config::SourceSpec;
use crate::error::{EtlError, Result};
use csv::{ReaderBuilder, StringRecordsIntoIter};
use encoding_rs::{Encoding, UTF_8};
use glob::glob;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// One physical input: a plain file or an entry of an archive.
#[derive(Debug, Clone)]
enum Input {
    File(PathBuf),
    ZipEntry {
        archive: PathBuf,
        index: usize,
        name: String,
    },
}

impl Input {
    fn origin(&self) -> String {
        match self {
            Input::File(p) => p.display().to_string(),
            Input::ZipEntry { archive, name, .. } => format!("{}!{}", archive.display(), name),
        }
    }
}

/// A row as read from source. Columns missing from this input's header
/// read as `None`, the same as an empty cell after normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub origin: Arc<str>,
    /// 1-based data row within `origin`.
    pub row: u64,
    headers: Arc<Vec<String>>,
    values: Vec<String>,
}

impl RawRecord {
    pub fn new(origin: &str, row: u64, headers: Arc<Vec<String>>, values: Vec<String>) -> Self {
        Self {
            origin: Arc::from(origin),
            row,
            headers,
            values,
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.headers.iter().position(|h| h == column)?;
        self.values.get(idx).map(String::as_str)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

/// Resolved source: the list of inputs a pattern expands to.
#[derive(Debug, Clone)]
pub struct RecordSource {
    inputs: Vec<Input>,
    delimiter: u8,
    encoding: &'static Encoding,
    max_rows: Option<u64>,
}

impl RecordSource {
    /// Expand `spec.path` and list archive entries. Nothing is read yet.
    pub fn new(spec: &SourceSpec) -> Result<Self> {
        let encoding = Encoding::for_label(spec.encoding.as_bytes()).ok_or_else(|| {
            EtlError::Config(format!("unknown encoding label {}", spec.encoding))
        })?;

        let mut paths: Vec<PathBuf> = glob(&spec.path)
            .map_err(|e| EtlError::SourceRead {
                path: spec.path.clone(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(EtlError::SourceRead {
                path: spec.path.clone(),
                reason: "no input file matches".into(),
            });
        }

        let mut inputs = Vec::new();
        for path in paths {
            if archive::is_zip(&path) {
                for (index, name) in archive::csv_entries(&path)? {
                    inputs.push(Input::ZipEntry {
                        archive: path.clone(),
                        index,
                        name,
                    });
                }
            } else {
                inputs.push(Input::File(path));
            }
        }
        info!(pattern = %spec.path, inputs = inputs.len(), "resolved source");

        Ok(Self {
            inputs,
            delimiter: spec.delimiter as u8,
            encoding,
            max_rows: spec.max_rows,
        })
    }

    pub fn origins(&self) -> Vec<String> {
        self.inputs.iter().map(Input::origin).collect()
    }

    /// Union of every input's header, in order of first appearance.
    pub fn headers(&self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for input in &self.inputs {
            let opened = self.open_input(input)?;
            for h in opened.headers.iter() {
                if !out.contains(h) {
                    out.push(h.clone());
                }
            }
        }
        Ok(out)
    }

    /// Start a fresh pass over every input.
    pub fn open(&self) -> RecordStream<'_> {
        RecordStream {
            source: self,
            pending: self.inputs.iter().cloned().collect(),
            current: None,
            remaining: self.max_rows,
        }
    }

    fn reader_for(&self, input: &Input) -> Result<Box<dyn Read>> {
        let origin = input.origin();
        let read_err = |e: std::io::Error| EtlError::SourceRead {
            path: origin.clone(),
            reason: e.to_string(),
        };

        let raw: Vec<u8> = match input {
            Input::File(path) if self.encoding == UTF_8 => {
                let file = File::open(path).map_err(read_err)?;
                return Ok(Box::new(BufReader::new(file)));
            }
            Input::File(path) => fs::read(path).map_err(read_err)?,
            Input::ZipEntry { archive, index, .. } => archive::read_entry(archive, *index)?,
        };

        let (text, had_errors) = self.encoding.decode_with_bom_removal(&raw);
        if had_errors {
            debug!(origin = %origin, encoding = self.encoding.name(), "replaced undecodable bytes");
        }
        Ok(Box::new(Cursor::new(text.into_owned().into_bytes())))
    }

    fn open_input(&self, input: &Input) -> Result<OpenInput> {
        let origin = input.origin();
        let reader = self.reader_for(input)?;
        let mut rdr = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()
            .map_err(|e| EtlError::SourceRead {
                path: origin.clone(),
                reason: e.to_string(),
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        debug!(origin = %origin, columns = headers.len(), "opened input");

        Ok(OpenInput {
            origin: Arc::from(origin.as_str()),
            headers: Arc::new(headers),
            records: rdr.into_records(),
            row: 0,
        })
    }
}

struct OpenInput {
    origin: Arc<str>,
    headers: Arc<Vec<String>>,
    records: StringRecordsIntoIter<Box<dyn Read>>,
    row: u64,
}

/// Lazy iterator over the records of every input of a [`RecordSource`].
/// The first error ends the stream.
pub struct RecordStream<'a> {
    source: &'a RecordSource,
    pending: VecDeque<Input>,
    current: Option<OpenInput>,
    remaining: Option<u64>,
}

impl Iterator for RecordStream<'_> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            if self.current.is_none() {
                let input = self.pending.pop_front()?;
                match self.source.open_input(&input) {
                    Ok(opened) => self.current = Some(opened),
                    Err(e) => {
                        self.pending.clear();
                        return Some(Err(e));
                    }
                }
            }

            let cur = self.current.as_mut()?;
            match cur.records.next() {
                Some(Ok(record)) => {
                    cur.row += 1;
                    if let Some(n) = self.remaining.as_mut() {
                        *n -= 1;
                    }
                    return Some(Ok(RawRecord {
                        origin: Arc::clone(&cur.origin),
                        row: cur.row,
                        headers: Arc::clone(&cur.headers),
                        values: record.iter().map(str::to_string).collect(),
                    }));
                }
                Some(Err(e)) => {
                    let err = EtlError::SourceRead {
                        path: cur.origin.to_string(),
                        reason: format!("row {}: {}", cur.row + 1, e),
                    };
                    self.current = None;
                    self.pending.clear();
                    return Some(Err(err));
                }
                None => self.current = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::path::Path;

    fn spec(path: &Path, delimiter: char) -> SourceSpec {
        SourceSpec {
            path: path.display().to_string(),
            delimiter,
            encoding: "utf-8".into(),
            max_rows: None,
        }
    }

    #[test]
    fn backfills_columns_missing_from_one_vintage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("2020.csv"), "BRAND;MODEL\nZAZ;SENS\n")?;
        fs::write(dir.path().join("2021.csv"), "BRAND;MODEL;VIN\nVAZ;2107;X1\n")?;

        let source = RecordSource::new(&spec(&dir.path().join("*.csv"), ';'))?;
        assert_eq!(source.headers()?, vec!["BRAND", "MODEL", "VIN"]);

        let rows: Vec<RawRecord> = source.open().collect::<crate::error::Result<_>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("BRAND"), Some("ZAZ"));
        assert_eq!(rows[0].get("VIN"), None);
        assert_eq!(rows[1].get("VIN"), Some("X1"));
        assert_eq!(rows[1].row, 1);
        Ok(())
    }

    #[test]
    fn stream_is_restartable_and_capped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("listings.csv");
        fs::write(&path, "id,price\n1,$10\n2,$20\n3,$30\n")?;

        let mut s = spec(&path, ',');
        s.max_rows = Some(2);
        let source = RecordSource::new(&s)?;
        assert_eq!(source.open().count(), 2);
        assert_eq!(source.open().count(), 2);
        Ok(())
    }

    #[test]
    fn reads_csv_entries_inside_zip_archives() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let zip_path = dir.path().join("tz_opendata_z01012021.zip");
        archive::tests::write_zip(
            &zip_path,
            &[("tz_opendata_z01012021.csv", "PERSON;COLOR\nP;RED\nJ;BLUE\n")],
        )?;

        let source = RecordSource::new(&spec(&zip_path, ';'))?;
        let rows: Vec<RawRecord> = source.open().collect::<crate::error::Result<_>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("COLOR"), Some("BLUE"));
        assert!(rows[1].origin.ends_with("!tz_opendata_z01012021.csv"));
        Ok(())
    }

    #[test]
    fn decodes_legacy_encodings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("reestr.csv");
        // "DEP;BRAND\nКиїв;ЗАЗ\n" in windows-1251
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode("DEP;BRAND\nКиїв;ЗАЗ\n");
        fs::write(&path, bytes.as_ref())?;

        let mut s = spec(&path, ';');
        s.encoding = "windows-1251".into();
        let source = RecordSource::new(&s)?;
        let rows: Vec<RawRecord> = source.open().collect::<crate::error::Result<_>>()?;
        assert_eq!(rows[0].get("DEP"), Some("Київ"));
        assert_eq!(rows[0].get("BRAND"), Some("ЗАЗ"));
        Ok(())
    }

    #[test]
    fn missing_input_is_a_source_read_error() {
        let err = RecordSource::new(&spec(Path::new("/definitely/not/here.csv"), ',')).unwrap_err();
        assert!(matches!(err, EtlError::SourceRead { .. }));
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, "a\n1\n").unwrap();
        let mut s = spec(&path, ',');
        s.encoding = "klingon-8".into();
        assert!(matches!(RecordSource::new(&s), Err(EtlError::Config(_))));
    }
}
