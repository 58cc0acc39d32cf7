//! Purpose: Compile and evaluate record selectors such as `r.idx >= 3 and r.foo == "bar"`.
//! Exports: `CompiledSelector`, `compile`.
//! Role: Small embedded expression language used to filter record streams.
//! Invariants: Compilation is pure parsing; malformed text is a `Syntax` error.
//! Invariants: Type checks happen per record; `matches` counts a `TypeMismatch` as no match.
//! Invariants: A compiled selector is immutable and shareable across threads.
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::core::error::Error;
use crate::core::record::Record;

mod eval;
mod parse;

#[derive(Clone)]
pub struct CompiledSelector {
    text: Arc<str>,
    expr: Arc<parse::Expr>,
}

pub fn compile(text: &str) -> Result<CompiledSelector, Error> {
    CompiledSelector::compile(text)
}

impl CompiledSelector {
    pub fn compile(text: &str) -> Result<Self, Error> {
        let expr = parse::parse(text)?;
        Ok(Self {
            text: Arc::from(text),
            expr: Arc::new(expr),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluates the selector, surfacing type mismatches to the caller.
    pub fn try_match(&self, record: &Record) -> Result<bool, Error> {
        let value = eval::eval(&self.expr, record)?;
        Ok(eval::truthy(&value))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self.try_match(record) {
            Ok(matched) => matched,
            Err(err) => {
                debug!(selector = %self.text, error = %err, "selector excluded record");
                false
            }
        }
    }
}

impl fmt::Debug for CompiledSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSelector")
            .field("text", &self.text)
            .finish()
    }
}

impl fmt::Display for CompiledSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
