//! Interpreter lines for produced payloads.
//!
//! A module names its interpreter in its shebang. Per host, variable
//! `ansible_<basename>_interpreter` may point somewhere else; the value is
//! rendered before use and the original interpreter arguments are kept.

use log::debug;

use crate::{
    bootstrap::ENCODING_LINE,
    templar::{RenderError, VariableRenderer},
};

pub const DEFAULT_INTERPRETER: &str = "/usr/bin/python";

const SHEBANG_PREFIX: &str = "#!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shebang {
    pub interpreter: String,
    pub args: Vec<String>,
}

impl Shebang {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args: Vec::new(),
        }
    }

    /// Parse a `#!interpreter arg...` line.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix(SHEBANG_PREFIX)?;
        let mut words = rest.split_whitespace();
        let interpreter = words.next()?.to_owned();
        Some(Self {
            interpreter,
            args: words.map(str::to_owned).collect(),
        })
    }

    /// Shebang of the first line of `source`, if it has one.
    pub fn from_source(source: &[u8]) -> Option<Self> {
        let first = source.split(|b| *b == b'\n').next()?;
        Self::parse(std::str::from_utf8(first).ok()?)
    }

    pub fn basename(&self) -> &str {
        self.interpreter
            .rsplit('/')
            .next()
            .unwrap_or(&self.interpreter)
            .trim()
    }

    pub fn is_python(&self) -> bool {
        self.basename().starts_with("python")
    }

    pub fn line(&self) -> String {
        let mut line = format!("{SHEBANG_PREFIX}{}", self.interpreter);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Variable that overrides this interpreter.
    pub fn override_variable(&self) -> String {
        format!("ansible_{}_interpreter", self.basename())
    }

    /// The shebang line to use on a host, or `None` when no override is set
    /// and the caller's own line should stand.
    pub fn resolve(&self, vars: &dyn VariableRenderer) -> Result<Option<String>, RenderError> {
        let variable = self.override_variable();
        let Some(raw) = vars.get(&variable) else {
            return Ok(None);
        };
        let interpreter = vars.render(raw.trim())?;
        debug!("Interpreter {} overridden by {variable}: {interpreter}", self.interpreter);
        Ok(Some(
            Self {
                interpreter,
                args: self.args.clone(),
            }
            .line(),
        ))
    }

    /// Like [`Shebang::resolve`], falling back to this interpreter.
    pub fn resolve_or_self(&self, vars: &dyn VariableRenderer) -> Result<String, RenderError> {
        Ok(self.resolve(vars)?.unwrap_or_else(|| self.line()))
    }
}

/// Rewrite the shebang of a module shipped as-is.
///
/// Returns the new source and the shebang in effect. Sources without a
/// shebang are returned unchanged. Python modules additionally get an
/// encoding line after the shebang.
pub fn rewrite_shebang(
    source: &[u8],
    vars: &dyn VariableRenderer,
) -> Result<(Vec<u8>, Option<String>), RenderError> {
    let Some(shebang) = Shebang::from_source(source) else {
        return Ok((source.to_vec(), None));
    };
    let (first, rest) = match source.iter().position(|b| *b == b'\n') {
        Some(idx) => (&source[..idx], Some(&source[idx + 1..])),
        None => (source, None),
    };

    let line = match shebang.resolve(vars)? {
        Some(line) => line,
        None => String::from_utf8_lossy(first).trim().to_owned(),
    };

    let mut out = Vec::with_capacity(source.len() + ENCODING_LINE.len() + 2);
    out.extend_from_slice(line.as_bytes());
    if shebang.is_python() {
        out.push(b'\n');
        out.extend_from_slice(ENCODING_LINE.as_bytes());
    }
    if let Some(rest) = rest {
        out.push(b'\n');
        out.extend_from_slice(rest);
    }
    Ok((out, Some(line)))
}
