// src/pipeline/report.rs

use super::state::RelationStates;
use crate::error::EtlError;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Drop,
    Stage,
    Dimension,
    Fact,
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Drop => "drop",
            StepKind::Stage => "stage",
            StepKind::Dimension => "dimension",
            StepKind::Fact => "fact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { rows: u64 },
    Failed { error: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub kind: StepKind,
    pub relation: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StepResult {
    pub fn succeeded(kind: StepKind, relation: &str, rows: u64, elapsed: Duration) -> Self {
        Self {
            kind,
            relation: relation.to_string(),
            outcome: StepOutcome::Succeeded { rows },
            elapsed,
        }
    }

    pub fn failed(kind: StepKind, relation: &str, err: &EtlError, elapsed: Duration) -> Self {
        Self {
            kind,
            relation: relation.to_string(),
            outcome: StepOutcome::Failed {
                error: err.kind().to_string(),
                message: err.to_string(),
            },
            elapsed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StepOutcome::Failed { .. })
    }

    pub fn rows(&self) -> Option<u64> {
        match self.outcome {
            StepOutcome::Succeeded { rows } => Some(rows),
            StepOutcome::Failed { .. } => None,
        }
    }

    pub fn rows_per_sec(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        self.rows().filter(|_| secs > 0.0).map(|r| r as f64 / secs)
    }
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            StepOutcome::Succeeded { rows } => {
                write!(
                    f,
                    "ok     {:<9} {} rows={} in {:.2?}",
                    self.kind.as_str(),
                    self.relation,
                    rows,
                    self.elapsed
                )?;
                if let Some(rate) = self.rows_per_sec() {
                    write!(f, " ({:.0} rows/s)", rate)?;
                }
                Ok(())
            }
            StepOutcome::Failed { error, message } => write!(
                f,
                "FAILED {:<9} {} {}: {}",
                self.kind.as_str(),
                self.relation,
                error,
                message
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepResult>,
    pub states: RelationStates,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !self.steps.iter().any(StepResult::is_failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.is_failed())
    }

    /// One line per failed step.
    pub fn failure_lines(&self) -> Vec<String> {
        self.failures().map(|s| s.to_string()).collect()
    }

    pub fn write_json(&self, path: &Path) -> crate::error::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| EtlError::Io(e.into()))?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(f, "{}", step)?;
        }
        let failed = self.failures().count();
        write!(
            f,
            "{} steps, {} failed, {:.2?} total",
            self.steps.len(),
            failed,
            self.elapsed
        )
    }
}
