//! Filter pipelines with bounded match history
//!
//! Building a pipeline happens in two steps. [`prepare`] loads every script
//! and entry point a target needs into [`PipelineBlueprint`]s; this is the
//! only fallible part. [`assemble`] then merges the blueprints with the live
//! pipelines through an explicit continuity table keyed by
//! `(filter id, sub filter id)`, so history and counters survive a reload
//! whenever both ids are unchanged.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::config::{Config, DEFAULT_HISTORY_LIMIT};
use crate::error::{Error, Result};

use super::script::{Predicate, ScriptLoader, Summary};

/// Prefix of the history entry recorded when a sub filter predicate fails
pub const FILTER_ERROR_PREFIX: &str = "filter err: ";

/// Pipelines of one target, keyed (and iterated) by filter id
pub type Pipelines = BTreeMap<String, FilterPipeline>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub file: String,
    pub line: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub total: u64,
    pub ignored: u64,
    pub printed: u64,
}

/// One dashboard row: the summary column and the message column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub summary: String,
    pub message: String,
}

/// Loaded entry points of a sub filter, not yet bound to any state
pub struct SubFilterBlueprint {
    pub id: String,
    pub predicate: Arc<dyn Predicate>,
    pub summary: Option<Arc<dyn Summary>>,
    pub limit: usize,
}

pub struct PipelineBlueprint {
    pub id: String,
    pub base: Arc<dyn Predicate>,
    pub sub_filters: Vec<SubFilterBlueprint>,
}

pub struct SubFilterState {
    id: String,
    predicate: Arc<dyn Predicate>,
    summary: Option<Arc<dyn Summary>>,
    limit: usize,
    history: VecDeque<HistoryEntry>,
    counters: Counters,
}

impl SubFilterState {
    pub fn new(blueprint: SubFilterBlueprint) -> Self {
        Self {
            id: blueprint.id,
            predicate: blueprint.predicate,
            summary: blueprint.summary,
            limit: blueprint.limit,
            history: VecDeque::with_capacity(blueprint.limit),
            counters: Counters::default(),
        }
    }

    /// Swap in freshly loaded entry points, keeping history and counters
    fn rebind(&mut self, blueprint: SubFilterBlueprint) {
        self.predicate = blueprint.predicate;
        self.summary = blueprint.summary;
        self.limit = blueprint.limit;
        self.evict();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Retained entries, oldest first
    pub fn history(&self) -> impl ExactSizeIterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn observe(&mut self, file: &str, line: &str) {
        match self.predicate.evaluate(line) {
            Ok(verdict) if verdict.matched => {
                self.counters.total += 1;
                if verdict.ignore {
                    self.counters.ignored += 1;
                    return;
                }
                self.counters.printed += 1;
                self.record(file, line, verdict.summary);
            }
            Ok(_) => {}
            // visible in history, deliberately not counted
            Err(e) => self.record(file, line, format!("{FILTER_ERROR_PREFIX}{e}")),
        }
    }

    fn record(&mut self, file: &str, line: &str, summary: String) {
        self.history.push_back(HistoryEntry {
            file: file.to_string(),
            line: line.to_string(),
            summary,
        });
        self.evict();
    }

    fn evict(&mut self) {
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    /// Aggregate row followed by the history, most recent first
    pub fn records(&self) -> Vec<RecordRow> {
        let Counters {
            total,
            ignored,
            printed,
        } = self.counters;
        let mut rows = Vec::with_capacity(self.history.len() + 1);
        rows.push(RecordRow {
            summary: format!("total:{total} ignore:{ignored} print:{printed}"),
            message: self
                .summary
                .as_ref()
                .map(|summary| summary.summarize())
                .unwrap_or_default(),
        });
        rows.extend(self.history.iter().rev().map(|entry| RecordRow {
            summary: entry.summary.clone(),
            message: entry.line.clone(),
        }));
        rows
    }
}

pub struct FilterPipeline {
    id: String,
    base: Arc<dyn Predicate>,
    sub_filters: Vec<SubFilterState>,
}

impl FilterPipeline {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sub_filters(&self) -> &[SubFilterState] {
        &self.sub_filters
    }

    pub fn sub_filter(&self, id: &str) -> Option<&SubFilterState> {
        self.sub_filters.iter().find(|sub| sub.id == id)
    }

    /// Run the base predicate as a gate, then every sub filter in order.
    ///
    /// Returns whether the gate let the line through. Base predicate errors
    /// count as a non-match and are only logged.
    pub fn evaluate(&mut self, file: &str, line: &str) -> bool {
        match self.base.evaluate(line) {
            Ok(verdict) if verdict.matched => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(filter = %self.id, "base filter error on line {line:?}: {e}");
                return false;
            }
        }

        trace!(filter = %self.id, "line passed base filter");
        for sub in &mut self.sub_filters {
            sub.observe(file, line);
        }
        true
    }
}

/// Load everything the pipelines of `target_id` need from `config`
pub fn prepare(
    config: &Config,
    target_id: &str,
    loader: &dyn ScriptLoader,
) -> Result<Vec<PipelineBlueprint>> {
    let target = config
        .target(target_id)
        .ok_or_else(|| Error::TargetNotFound(target_id.to_string()))?;

    let mut blueprints = Vec::with_capacity(target.filters.len());
    for filter_id in &target.filters {
        let filter = config.filter(filter_id).ok_or_else(|| Error::FilterNotFound {
            target: target_id.to_string(),
            filter: filter_id.clone(),
        })?;
        let pipeline_error = |source| Error::Pipeline {
            filter: filter_id.clone(),
            source,
        };

        let script = loader
            .load(filter_id, &filter.script)
            .map_err(pipeline_error)?;
        let base = script
            .predicate(&filter.check_function_name)
            .map_err(pipeline_error)?;

        let mut sub_filters = Vec::with_capacity(filter.sub_filters.len());
        for sub in &filter.sub_filters {
            let predicate = script
                .predicate(&sub.check_function_name)
                .map_err(pipeline_error)?;
            let summary = sub
                .summary_function_name
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(|name| script.summary(name))
                .transpose()
                .map_err(pipeline_error)?;

            sub_filters.push(SubFilterBlueprint {
                id: sub.id.clone(),
                predicate,
                summary,
                limit: if sub.amount == 0 {
                    DEFAULT_HISTORY_LIMIT
                } else {
                    sub.amount
                },
            });
        }

        blueprints.push(PipelineBlueprint {
            id: filter_id.clone(),
            base,
            sub_filters,
        });
    }

    Ok(blueprints)
}

/// Bind blueprints to state, carrying forward every sub filter whose
/// `(filter id, sub filter id)` pair exists in `previous`.
pub fn assemble(blueprints: Vec<PipelineBlueprint>, previous: Pipelines) -> Pipelines {
    let mut carried: HashMap<(String, String), SubFilterState> = previous
        .into_values()
        .flat_map(|pipeline| {
            let filter_id = pipeline.id;
            pipeline
                .sub_filters
                .into_iter()
                .map(move |sub| ((filter_id.clone(), sub.id.clone()), sub))
        })
        .collect();

    blueprints
        .into_iter()
        .map(|blueprint| {
            let sub_filters = blueprint
                .sub_filters
                .into_iter()
                .map(|sub| match carried.remove(&(blueprint.id.clone(), sub.id.clone())) {
                    Some(mut state) => {
                        state.rebind(sub);
                        state
                    }
                    None => SubFilterState::new(sub),
                })
                .collect();

            let pipeline = FilterPipeline {
                id: blueprint.id.clone(),
                base: blueprint.base,
                sub_filters,
            };
            (blueprint.id, pipeline)
        })
        .collect()
}
