// src/pipeline/mod.rs

//! Pipeline Orchestrator.
//!
//! A run drops the relations it will rebuild (facts first), stages every
//! configured source, builds every dimension and finally every fact whose
//! prerequisites all succeeded. A failed step is recorded and the run
//! moves on to whatever does not depend on it.

pub mod report;
pub mod state;

pub use report::{RunReport, StepKind, StepOutcome, StepResult};
pub use state::{RelationState, RelationStates};

use crate::config::PipelineConfig;
use crate::error::{EtlError, Result};
use crate::stage::load_staging;
use crate::store::RelationalStore;
use crate::warehouse::{DimensionBuilder, FactBuilder};
use std::time::Instant;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Reload staging relations from their sources.
    pub stage: bool,
    /// Drop dimension and fact relations before rebuilding them. When
    /// false, rebuilt dimensions are cleared and renumbered in place, and a
    /// fact skipped for a failed dependency has its old rows deleted since
    /// they would point at reassigned surrogate keys.
    pub drop_existing: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stage: true,
            drop_existing: true,
        }
    }
}

pub struct Pipeline<'s, S: RelationalStore> {
    store: &'s S,
    config: &'s PipelineConfig,
}

impl<'s, S: RelationalStore> Pipeline<'s, S> {
    pub fn new(store: &'s S, config: &'s PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Run every step. Only an unusable store or configuration aborts the
    /// run; step failures end up in the report.
    #[instrument(level = "info", skip_all, fields(stage = options.stage, drop_existing = options.drop_existing))]
    pub fn run(&self, options: RunOptions) -> Result<RunReport> {
        let started = Instant::now();
        self.store.ping()?;
        self.config.validate()?;

        let mut steps = Vec::new();
        let mut states = RelationStates::default();

        if options.drop_existing {
            self.drop_existing(&mut steps);
        }

        for spec in &self.config.staging {
            let relation = self.config.staging_relation(&spec.name).to_string();
            if !options.stage {
                let started = Instant::now();
                let state = match self
                    .store
                    .relation_exists(&self.config.staging_relation(&spec.name))
                {
                    Ok(true) => RelationState::Staged,
                    Ok(false) => {
                        warn!(relation = %spec.name, "staging skipped and relation absent");
                        RelationState::Absent
                    }
                    Err(e) => {
                        error!(relation = %relation, error = %e, "staging lookup failed");
                        steps.push(StepResult::failed(
                            StepKind::Stage,
                            &relation,
                            &e,
                            started.elapsed(),
                        ));
                        RelationState::Failed
                    }
                };
                states.set(&spec.name, state);
                continue;
            }
            let step = self.step(StepKind::Stage, &relation, || {
                load_staging(self.store, self.config, spec)
            });
            states.set(&spec.name, success_state(&step, RelationState::Staged));
            steps.push(step);
        }

        let dims = DimensionBuilder::new(self.store, self.config);
        for spec in &self.config.dimensions {
            let relation = self.config.warehouse_relation(&spec.name).to_string();
            let step = match states.failed_dependency(spec.source.as_deref()) {
                Some(dep) => skipped(StepKind::Dimension, &relation, dep),
                None => self.step(StepKind::Dimension, &relation, || dims.build(spec)),
            };
            states.set(&spec.name, success_state(&step, RelationState::Dimensioned));
            steps.push(step);
        }

        let facts = FactBuilder::new(self.store, self.config);
        for spec in &self.config.facts {
            let relation = self.config.warehouse_relation(&spec.name).to_string();
            let deps = spec
                .source
                .relations()
                .chain(spec.dimensions.iter().map(|d| d.dimension.as_str()));
            let step = match states.failed_dependency(deps) {
                Some(dep) => {
                    if !options.drop_existing {
                        self.clear_stale(&spec.name);
                    }
                    skipped(StepKind::Fact, &relation, dep)
                }
                None => self.step(StepKind::Fact, &relation, || facts.build(spec)),
            };
            states.set(&spec.name, success_state(&step, RelationState::Facted));
            steps.push(step);
        }

        let report = RunReport {
            steps,
            states,
            elapsed: started.elapsed(),
        };
        info!(
            steps = report.steps.len(),
            failed = report.failures().count(),
            elapsed = ?report.elapsed,
            "run finished"
        );
        Ok(report)
    }

    /// Facts go first so no dimension is dropped while a fact still
    /// refers to it.
    fn drop_existing(&self, steps: &mut Vec<StepResult>) {
        let relations = self
            .config
            .facts
            .iter()
            .map(|f| &f.name)
            .chain(self.config.dimensions.iter().map(|d| &d.name));
        for name in relations {
            let relation = self.config.warehouse_relation(name);
            let started = Instant::now();
            match self.store.drop_relation(&relation) {
                Ok(()) => info!(relation = %relation, "dropped"),
                Err(e) => {
                    error!(relation = %relation, error = %e, "drop failed");
                    steps.push(StepResult::failed(
                        StepKind::Drop,
                        &relation.to_string(),
                        &e,
                        started.elapsed(),
                    ));
                }
            }
        }
    }

    /// Delete the rows of a fact that will not be rebuilt this run.
    fn clear_stale(&self, name: &str) {
        let relation = self.config.warehouse_relation(name);
        let cleared = self.store.relation_exists(&relation).and_then(|exists| {
            if exists {
                self.store
                    .execute(&format!("DELETE FROM {}", relation.qualified()))
            } else {
                Ok(0)
            }
        });
        match cleared {
            Ok(0) => {}
            Ok(rows) => warn!(relation = %relation, rows, "cleared stale fact rows"),
            Err(e) => error!(relation = %relation, error = %e, "clearing stale fact rows failed"),
        }
    }

    fn step<F>(&self, kind: StepKind, relation: &str, build: F) -> StepResult
    where
        F: FnOnce() -> Result<u64>,
    {
        let started = Instant::now();
        match build() {
            Ok(rows) => StepResult::succeeded(kind, relation, rows, started.elapsed()),
            Err(e) => {
                error!(step = kind.as_str(), relation, error = %e, "step failed");
                StepResult::failed(kind, relation, &e, started.elapsed())
            }
        }
    }
}

fn skipped(kind: StepKind, relation: &str, dependency: &str) -> StepResult {
    let err = EtlError::DependencyFailed {
        relation: relation.to_string(),
        dependency: dependency.to_string(),
    };
    warn!(step = kind.as_str(), relation, dependency, "skipped");
    StepResult::failed(kind, relation, &err, Default::default())
}

fn success_state(step: &StepResult, on_success: RelationState) -> RelationState {
    if step.is_failed() {
        RelationState::Failed
    } else {
        on_success
    }
}
