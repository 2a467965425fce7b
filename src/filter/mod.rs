//! Line filtering: predicate capabilities, the Luau loader and pipelines

pub mod lua;
pub mod pipeline;
pub mod script;

pub use pipeline::{FilterPipeline, HistoryEntry, Pipelines, RecordRow};
pub use script::{Predicate, Script, ScriptError, ScriptLoader, Summary, Verdict};
