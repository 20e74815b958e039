//! Classification of module sources, and the in-place substitutions of the
//! legacy styles.
//!
//! Classification sniffs raw bytes; the first matching rule wins:
//!
//! 1. binary content
//! 2. the legacy include marker (substituted, shipped as-is)
//! 3. a modern helper import
//! 4. shell-wrapper markers or requirement headers
//! 5. the JSON-args marker (substituted, shipped as-is)
//! 6. `WANT_JSON`
//! 7. anything else is a legacy key=value module

use once_cell::sync::Lazy;
use regex::bytes::{NoExpand, Regex};

use crate::{
    args::{ModuleArgs, args_json},
    bootstrap::python_string_literal,
    module_name::ModuleName,
    types::DispatchStyle,
};

pub const INCLUDE_COMMON_MARKER: &str = "#<<INCLUDE_ANSIBLE_MODULE_COMMON>>";
pub const SHELL_COMMON_MARKER: &str = "# POWERSHELL_COMMON";
pub const JSON_ARGS_MARKER: &str = "<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>";
pub const VERSION_MARKER: &str = "\"<<ANSIBLE_VERSION>>\"";
pub const COMPLEX_ARGS_MARKER: &str = "\"<<INCLUDE_ANSIBLE_MODULE_COMPLEX_ARGS>>\"";
pub const SELINUX_MARKER: &str = "<<SELINUX_SPECIAL_FILESYSTEMS>>";
pub const WANT_JSON_MARKER: &str = "WANT_JSON";
const SYSLOG_DEFAULT: &str = "syslog.LOG_USER";

/// What a shell-common marker is rewritten to before wrapping.
const SHELL_LEGACY_REQUIRES: &[u8] = b"#Requires -Module Ansible.ModuleUtils.Legacy";

/// Only this many leading bytes are inspected for binary content.
const BINARY_SNIFF_LEN: usize = 1024;

static SHELL_REQUIRES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i-u)#Requires -(?:Module|Version)|#AnsibleRequires -(?:OSVersion|Powershell|CSharpUtil|Become|Wrapper)",
    )
    .expect("requires pattern is valid")
});

static INCLUDE_COMMON: Lazy<Regex> = Lazy::new(|| literal(INCLUDE_COMMON_MARKER));
static SHELL_COMMON: Lazy<Regex> = Lazy::new(|| literal(SHELL_COMMON_MARKER));
static JSON_ARGS: Lazy<Regex> = Lazy::new(|| literal(JSON_ARGS_MARKER));
static VERSION: Lazy<Regex> = Lazy::new(|| literal(VERSION_MARKER));
static COMPLEX_ARGS: Lazy<Regex> = Lazy::new(|| literal(COMPLEX_ARGS_MARKER));
static SELINUX: Lazy<Regex> = Lazy::new(|| literal(SELINUX_MARKER));
static WANT_JSON: Lazy<Regex> = Lazy::new(|| literal(WANT_JSON_MARKER));
static SYSLOG_FACILITY: Lazy<Regex> = Lazy::new(|| literal(SYSLOG_DEFAULT));

fn literal(marker: &str) -> Regex {
    Regex::new(&regex::escape(marker)).expect("escaped marker is a valid pattern")
}

fn replace_all(pattern: &Regex, haystack: &[u8], replacement: &[u8]) -> Vec<u8> {
    pattern
        .replace_all(haystack, NoExpand(replacement))
        .into_owned()
}

/// Whether any of the first KiB falls outside the printable-text byte set
/// (BEL, BS, TAB, LF, FF, CR, ESC and `0x20..=0xff` except DEL).
pub fn is_binary(source: &[u8]) -> bool {
    source.iter().take(BINARY_SNIFF_LEN).any(|&b| {
        let text = matches!(b, 7 | 8 | 9 | 10 | 12 | 13 | 27) || (b >= 0x20 && b != 0x7f);
        !text
    })
}

/// Values substituted into legacy JSON-args modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySubstitutions {
    pub version: String,
    pub selinux_special_fs: Vec<String>,
    /// Syslog facility name, e.g. `LOG_USER`
    pub syslog_facility: String,
}

impl Default for LegacySubstitutions {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            selinux_special_fs: ["fuse", "nfs", "vboxsf", "ramfs", "9p", "vfat"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            syslog_facility: "LOG_USER".to_owned(),
        }
    }
}

/// A classified source, substituted where its style requires it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprocessed {
    pub style: DispatchStyle,
    pub source: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SubstylePreprocessor {
    core: ModuleName,
    modern_import: Regex,
}

impl SubstylePreprocessor {
    pub fn new(core: &ModuleName, external: &ModuleName) -> Result<Self, regex::Error> {
        Ok(Self {
            core: core.clone(),
            modern_import: modern_import_pattern(core, external)?,
        })
    }

    pub fn classify(&self, source: &[u8]) -> DispatchStyle {
        if is_binary(source) {
            DispatchStyle::Binary
        } else if INCLUDE_COMMON.is_match(source) {
            DispatchStyle::LegacyKeyValue
        } else if self.modern_import.is_match(source) {
            DispatchStyle::ModernClosurePacked
        } else if SHELL_COMMON.is_match(source) || SHELL_REQUIRES.is_match(source) {
            DispatchStyle::ModernShellWrapper
        } else if JSON_ARGS.is_match(source) {
            DispatchStyle::LegacyJsonArgs
        } else if WANT_JSON.is_match(source) {
            DispatchStyle::LegacyWantJson
        } else {
            DispatchStyle::LegacyKeyValue
        }
    }

    /// Classify and apply the style's substitutions.
    ///
    /// Fails only when JSON-args substitution cannot serialize `args`.
    pub fn process(
        &self,
        source: &[u8],
        args: &ModuleArgs,
        legacy: &LegacySubstitutions,
    ) -> serde_json::Result<Preprocessed> {
        let style = self.classify(source);
        let source = match style {
            DispatchStyle::LegacyKeyValue if INCLUDE_COMMON.is_match(source) => {
                let import = format!("from {}.basic import *", self.core);
                replace_all(&INCLUDE_COMMON, source, import.as_bytes())
            }
            DispatchStyle::ModernShellWrapper if SHELL_COMMON.is_match(source) => {
                replace_all(&SHELL_COMMON, source, SHELL_LEGACY_REQUIRES)
            }
            DispatchStyle::LegacyJsonArgs => substitute_json_args(source, args, legacy)?,
            _ => source.to_vec(),
        };
        Ok(Preprocessed { style, source })
    }
}

fn substitute_json_args(
    source: &[u8],
    args: &ModuleArgs,
    legacy: &LegacySubstitutions,
) -> serde_json::Result<Vec<u8>> {
    let json = args_json(args)?;
    let version = python_string_literal(&legacy.version);
    let complex = python_string_literal(&json);
    let selinux = legacy.selinux_special_fs.join(",");
    let facility = format!("syslog.{}", legacy.syslog_facility);

    let source = replace_all(&VERSION, source, version.as_bytes());
    let source = replace_all(&COMPLEX_ARGS, &source, complex.as_bytes());
    let source = replace_all(&SELINUX, &source, selinux.as_bytes());
    let source = replace_all(&JSON_ARGS, &source, json.as_bytes());
    Ok(replace_all(&SYSLOG_FACILITY, &source, facility.as_bytes()))
}

/// Absolute and relative helper imports plus external-package helper imports.
fn modern_import_pattern(core: &ModuleName, external: &ModuleName) -> Result<Regex, regex::Error> {
    let core_dotted = regex::escape(&core.dotted());
    let external_dotted = regex::escape(&external.dotted());
    let core_leaf = regex::escape(core.last().unwrap_or_default());
    Regex::new(&format!(
        r"(?-u)(?:from +\.{{2,}} *{core_leaf}.* +import |from +{external_dotted}\.[^.]+\.[^.]+\.plugins\.module_utils.* +import |import +{external_dotted}\.[^.]+\.[^.]+\.plugins\.module_utils.*|from +{core_dotted}.* +import |import +{core_dotted}\.)"
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::args::ArgValue;

    fn preprocessor() -> SubstylePreprocessor {
        SubstylePreprocessor::new(
            &ModuleName::parse("ansible.module_utils"),
            &ModuleName::parse("ansible_collections"),
        )
        .expect("valid namespaces")
    }

    #[test]
    fn test_binary_detection() {
        assert!(is_binary(b"\x7fELF\x02\x01\x01\x00"));
        assert!(!is_binary(b"#!/bin/sh\n\techo \x1b[1mhi\r\n"));
        assert!(!is_binary("caf\u{e9}\n".as_bytes()));

        let mut late_nul = vec![b'a'; BINARY_SNIFF_LEN];
        late_nul.push(0);
        assert!(!is_binary(&late_nul));
    }

    #[test]
    fn test_classification_precedence() {
        let p = preprocessor();
        let cases: &[(&[u8], DispatchStyle)] = &[
            (b"\x00\x01binary", DispatchStyle::Binary),
            (
                b"#<<INCLUDE_ANSIBLE_MODULE_COMMON>>\nimport ansible.module_utils.basic\n",
                DispatchStyle::LegacyKeyValue,
            ),
            (
                b"# WANT_JSON\nfrom ansible.module_utils.basic import AnsibleModule\n",
                DispatchStyle::ModernClosurePacked,
            ),
            (
                b"from ..module_utils.basic import AnsibleModule\n",
                DispatchStyle::ModernClosurePacked,
            ),
            (
                b"from ansible_collections.ns.coll.plugins.module_utils.net import x\n",
                DispatchStyle::ModernClosurePacked,
            ),
            (b"# POWERSHELL_COMMON\n", DispatchStyle::ModernShellWrapper),
            (b"#requires -module Ansible.ModuleUtils.Legacy\n", DispatchStyle::ModernShellWrapper),
            (b"#AnsibleRequires -CSharpUtil Ansible.Basic\n", DispatchStyle::ModernShellWrapper),
            (
                b"json_arguments = \"\"\"<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>\"\"\"\nWANT_JSON\n",
                DispatchStyle::LegacyJsonArgs,
            ),
            (b"#!/bin/sh\n# WANT_JSON\n", DispatchStyle::LegacyWantJson),
            (b"#!/bin/sh\necho hi\n", DispatchStyle::LegacyKeyValue),
            (b"import ansible.module_utils\n", DispatchStyle::LegacyKeyValue),
        ];
        for (source, expected) in cases {
            assert_eq!(
                p.classify(source),
                *expected,
                "{}",
                String::from_utf8_lossy(source)
            );
        }
    }

    #[test]
    fn test_include_marker_is_replaced() -> serde_json::Result<()> {
        let processed = preprocessor().process(
            b"#!/usr/bin/python\n#<<INCLUDE_ANSIBLE_MODULE_COMMON>>\nmain()\n",
            &ModuleArgs::new(),
            &LegacySubstitutions::default(),
        )?;
        assert_eq!(processed.style, DispatchStyle::LegacyKeyValue);
        assert_eq!(
            String::from_utf8_lossy(&processed.source),
            "#!/usr/bin/python\nfrom ansible.module_utils.basic import *\nmain()\n"
        );
        Ok(())
    }

    #[test]
    fn test_json_args_substitutions() -> serde_json::Result<()> {
        let source = concat!(
            "VERSION = \"<<ANSIBLE_VERSION>>\"\n",
            "COMPLEX = \"<<INCLUDE_ANSIBLE_MODULE_COMPLEX_ARGS>>\"\n",
            "ARGS = '<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>'\n",
            "FS = '<<SELINUX_SPECIAL_FILESYSTEMS>>'\n",
            "syslog.openlog('m', 0, syslog.LOG_USER)\n",
        );
        let mut args = ModuleArgs::new();
        args.insert("name".to_owned(), ArgValue::from("x"));
        let legacy = LegacySubstitutions {
            version: "2.9.0".to_owned(),
            selinux_special_fs: vec!["nfs".to_owned(), "vfat".to_owned()],
            syslog_facility: "LOG_LOCAL0".to_owned(),
        };

        let processed = preprocessor().process(source.as_bytes(), &args, &legacy)?;
        assert_eq!(processed.style, DispatchStyle::LegacyJsonArgs);
        assert_eq!(
            String::from_utf8_lossy(&processed.source),
            concat!(
                "VERSION = '2.9.0'\n",
                "COMPLEX = '{\"name\":\"x\"}'\n",
                "ARGS = '{\"name\":\"x\"}'\n",
                "FS = 'nfs,vfat'\n",
                "syslog.openlog('m', 0, syslog.LOG_LOCAL0)\n",
            )
        );
        Ok(())
    }

    #[test]
    fn test_json_args_with_unserializable_value() {
        let mut args = ModuleArgs::new();
        args.insert("bad".to_owned(), ArgValue::Float(f64::INFINITY));
        let result = preprocessor().process(
            b"ARGS = '<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>'\n",
            &args,
            &LegacySubstitutions::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_every_marker_occurrence_is_replaced() -> serde_json::Result<()> {
        let source = concat!(
            "ARGS = '<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>'\n",
            "AGAIN = '<<INCLUDE_ANSIBLE_MODULE_JSON_ARGS>>'\n",
            "EXPAND = '$0 ${1}'\n",
        );
        let mut args = ModuleArgs::new();
        args.insert("path".to_owned(), ArgValue::from("$HOME/${x}"));

        let processed =
            preprocessor().process(source.as_bytes(), &args, &LegacySubstitutions::default())?;
        assert_eq!(
            String::from_utf8_lossy(&processed.source),
            concat!(
                "ARGS = '{\"path\":\"$HOME/${x}\"}'\n",
                "AGAIN = '{\"path\":\"$HOME/${x}\"}'\n",
                "EXPAND = '$0 ${1}'\n",
            )
        );
        Ok(())
    }

    #[test]
    fn test_other_styles_are_untouched() -> serde_json::Result<()> {
        let source = b"#!/bin/sh\n# WANT_JSON\n";
        let processed =
            preprocessor().process(source, &ModuleArgs::new(), &LegacySubstitutions::default())?;
        assert_eq!(processed.style, DispatchStyle::LegacyWantJson);
        assert_eq!(processed.source, source);
        Ok(())
    }
}
