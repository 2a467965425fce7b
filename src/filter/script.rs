//! Predicate capabilities consumed by the filter pipeline
//!
//! The pipeline never knows how a predicate was produced. A [`ScriptLoader`]
//! turns a filter's script source into a [`Script`], and the script hands out
//! named entry points as [`Predicate`]s and [`Summary`]s. Entry points resolved
//! from the same script share its state, so a base predicate can prepare data
//! its sub filters read.

use std::sync::Arc;

/// Outcome of running a predicate against one line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub matched: bool,
    pub summary: String,
    /// Count the match but do not record it in history
    pub ignore: bool,
}

impl Verdict {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn hit(summary: impl Into<String>) -> Self {
        Self {
            matched: true,
            summary: summary.into(),
            ignore: false,
        }
    }

    pub fn ignored() -> Self {
        Self {
            matched: true,
            summary: String::new(),
            ignore: true,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("load script failed: {0}")]
    Load(String),

    #[error("not exists function {0}")]
    MissingEntry(String),

    #[error("function {name} has the wrong signature, expected {expected}")]
    WrongSignature { name: String, expected: &'static str },

    /// Raised by a predicate while evaluating a line
    #[error("{0}")]
    Runtime(String),
}

pub trait Predicate: Send + Sync {
    fn evaluate(&self, line: &str) -> Result<Verdict, ScriptError>;
}

pub trait Summary: Send + Sync {
    /// Render the aggregate summary shown as the first dashboard row
    fn summarize(&self) -> String;
}

/// A loaded script exposing named entry points
pub trait Script: Send + Sync {
    fn predicate(&self, entry: &str) -> Result<Arc<dyn Predicate>, ScriptError>;
    fn summary(&self, entry: &str) -> Result<Arc<dyn Summary>, ScriptError>;
}

/// Produces scripts from filter configuration
pub trait ScriptLoader: Send + Sync {
    /// Load `source` for the filter `filter_id`.
    ///
    /// Every call yields a fresh script instance with its own state.
    fn load(&self, filter_id: &str, source: &str) -> Result<Arc<dyn Script>, ScriptError>;
}

impl<F> Predicate for F
where
    F: Fn(&str) -> Result<Verdict, ScriptError> + Send + Sync,
{
    fn evaluate(&self, line: &str) -> Result<Verdict, ScriptError> {
        self(line)
    }
}

impl<F> Summary for F
where
    F: Fn() -> String + Send + Sync,
{
    fn summarize(&self) -> String {
        self()
    }
}
