//! Luau-backed script loader.
//!
//! A filter script is a Luau chunk defining global functions. Check functions
//! receive the line and return `matched, summary, ignore, err`; trailing values
//! may be omitted. Raising an error or returning a non-nil `err` reports a
//! predicate error. Summary functions take no argument and return a string.
//!
//! Scripts can call `re_find(pattern, text)`, which returns the first capture
//! group (or the whole match) of a regular expression, or nil.

use std::collections::HashMap;
use std::sync::Arc;

use mlua::{Function, Lua, Value};
use regex::Regex;
use tracing::trace;

use super::script::{Predicate, Script, ScriptError, ScriptLoader, Summary, Verdict};

#[derive(Debug, Default, Clone)]
pub struct LuaLoader;

impl LuaLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptLoader for LuaLoader {
    fn load(&self, filter_id: &str, source: &str) -> Result<Arc<dyn Script>, ScriptError> {
        let lua = Lua::new();
        install_helpers(&lua).map_err(|e| ScriptError::Load(e.to_string()))?;
        lua.load(source)
            .set_name(format!("filter:{filter_id}"))
            .exec()
            .map_err(|e| ScriptError::Load(first_line(&e)))?;

        trace!("loaded script for filter {filter_id}");
        Ok(Arc::new(LuaScript { lua: Arc::new(lua) }))
    }
}

fn install_helpers(lua: &Lua) -> mlua::Result<()> {
    let mut cache: HashMap<String, Regex> = HashMap::new();
    let re_find = lua.create_function_mut(move |_, (pattern, text): (String, String)| {
        if !cache.contains_key(&pattern) {
            let re = Regex::new(&pattern).map_err(|e| {
                mlua::Error::RuntimeError(format!("invalid pattern {pattern}: {e}"))
            })?;
            cache.insert(pattern.clone(), re);
        }
        let found = cache.get(&pattern).and_then(|re| {
            re.captures(&text).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
        });
        Ok(found)
    })?;
    lua.globals().set("re_find", re_find)
}

/// Lua error messages carry a stack traceback after the first line.
fn first_line(err: &mlua::Error) -> String {
    let message = err.to_string();
    message.lines().next().unwrap_or_default().to_string()
}

struct LuaScript {
    lua: Arc<Lua>,
}

impl LuaScript {
    fn function(&self, entry: &str, expected: &'static str) -> Result<Function, ScriptError> {
        let value: Value = self
            .lua
            .globals()
            .get(entry)
            .map_err(|e| ScriptError::Load(e.to_string()))?;
        match value {
            Value::Function(function) => Ok(function),
            Value::Nil => Err(ScriptError::MissingEntry(entry.to_string())),
            _ => Err(ScriptError::WrongSignature {
                name: entry.to_string(),
                expected,
            }),
        }
    }
}

impl Script for LuaScript {
    fn predicate(&self, entry: &str) -> Result<Arc<dyn Predicate>, ScriptError> {
        let function = self.function(entry, "function(line)")?;
        Ok(Arc::new(LuaPredicate {
            _lua: self.lua.clone(),
            function,
        }))
    }

    fn summary(&self, entry: &str) -> Result<Arc<dyn Summary>, ScriptError> {
        let function = self.function(entry, "function()")?;
        Ok(Arc::new(LuaSummary {
            _lua: self.lua.clone(),
            function,
        }))
    }
}

struct LuaPredicate {
    _lua: Arc<Lua>,
    function: Function,
}

impl Predicate for LuaPredicate {
    fn evaluate(&self, line: &str) -> Result<Verdict, ScriptError> {
        let (matched, summary, ignore, err) = self
            .function
            .call::<(Option<bool>, Option<String>, Option<bool>, Option<String>)>(line)
            .map_err(|e| ScriptError::Runtime(first_line(&e)))?;

        if let Some(err) = err {
            return Err(ScriptError::Runtime(err));
        }

        Ok(Verdict {
            matched: matched.unwrap_or(false),
            summary: summary.unwrap_or_default(),
            ignore: ignore.unwrap_or(false),
        })
    }
}

struct LuaSummary {
    _lua: Arc<Lua>,
    function: Function,
}

impl Summary for LuaSummary {
    fn summarize(&self) -> String {
        self.function
            .call::<String>(())
            .unwrap_or_else(|e| format!("summary err: {}", first_line(&e)))
    }
}
