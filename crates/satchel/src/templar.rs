//! Variable lookup and rendering used for per-host dispatch settings.
//!
//! The real templating engine lives outside this crate; builds only need the
//! small surface described by [`VariableRenderer`].

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RenderError {
    pub message: String,
}

pub trait VariableRenderer {
    /// Render a template string against the current variables.
    fn render(&self, template: &str) -> Result<String, RenderError>;

    /// Raw value of a variable, unrendered.
    fn get(&self, name: &str) -> Option<String>;
}

/// In-memory variables with `{{ name }}` substitution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticVars {
    vars: IndexMap<String, String>,
}

impl StaticVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Parse a `name=value` assignment as given on the command line.
    pub fn parse_assignment(assignment: &str) -> Option<(String, String)> {
        let (name, value) = assignment.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_owned(), value.to_owned()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticVars {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl VariableRenderer for StaticVars {
    fn render(&self, template: &str) -> Result<String, RenderError> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            if let Some(value) = self.vars.get(name) {
                value.clone()
            } else {
                missing.get_or_insert_with(|| name.to_owned());
                String::new()
            }
        });
        match missing {
            Some(name) => Err(RenderError {
                message: format!("'{name}' is undefined"),
            }),
            None => Ok(rendered.into_owned()),
        }
    }

    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let vars: StaticVars = [("py", "/opt/py/bin/python3"), ("limit", "1024")]
            .into_iter()
            .collect();
        assert_eq!(
            vars.render("{{ py }} -u {{limit}}"),
            Ok("/opt/py/bin/python3 -u 1024".to_owned())
        );
        assert_eq!(vars.render("plain"), Ok("plain".to_owned()));
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let vars = StaticVars::new();
        let err = vars.render("{{ missing }}").expect_err("undefined variable");
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            StaticVars::parse_assignment("ansible_python_interpreter=/usr/bin/python3"),
            Some((
                "ansible_python_interpreter".to_owned(),
                "/usr/bin/python3".to_owned()
            ))
        );
        assert_eq!(StaticVars::parse_assignment("novalue"), None);
        assert_eq!(StaticVars::parse_assignment("=x"), None);
    }
}
