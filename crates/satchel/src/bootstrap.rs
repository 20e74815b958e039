//! The generated Python loader that carries a packed module.
//!
//! The loader writes the embedded archive to a temporary directory, puts it
//! first on `sys.path`, hands the JSON arguments to the `basic` helper and
//! runs the target module as `__main__`. Two debug subcommands, `explode` and
//! `execute`, unpack the archive next to the script and run the unpacked copy.

use chrono::{DateTime, Datelike, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Declares the loader's own encoding; arguments may contain non-ASCII text.
pub const ENCODING_LINE: &str = "# -*- coding: utf-8 -*-";

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Z][A-Z_]*)@").expect("token pattern is valid"));

const LOADER_TEMPLATE: &str = r#"@SHEBANG@
@CODING@
_SATCHEL_WRAPPER = True
def _satchel_main():
@RLIMIT@
    import os
    import os.path
    import sys
    import __main__

    # A module named like a stdlib module would shadow it if the script's own
    # directory stayed on the path.
    scriptdir = None
    try:
        scriptdir = os.path.dirname(os.path.realpath(__main__.__file__))
    except (AttributeError, OSError):
        # no __file__ when read from stdin
        pass
    if scriptdir is not None:
        sys.path = [p for p in sys.path if p != scriptdir]

    import base64
    import runpy
    import shutil
    import tempfile
    import zipfile

    PY3 = sys.version_info >= (3,)

    ZIPDATA = """@ZIPDATA@"""

    def invoke_module(modlib_path, json_params):
        z = zipfile.ZipFile(modlib_path, mode='a')
        sitecustomize = u'import sys\nsys.path.insert(0,"%s")\n' % modlib_path
        sitecustomize = sitecustomize.encode('utf-8')
        # Explicit entry date: hosts with a pre-1980 clock cannot write one.
        zinfo = zipfile.ZipInfo()
        zinfo.filename = 'sitecustomize.py'
        zinfo.date_time = (@YEAR@, @MONTH@, @DAY@, @HOUR@, @MINUTE@, @SECOND@)
        z.writestr(zinfo, sitecustomize)
        z.close()

        sys.path.insert(0, modlib_path)

        from @HELPER_NAMESPACE@ import basic
        basic._ANSIBLE_ARGS = json_params
@COVERAGE@
        runpy.run_module(mod_name='@MODULE_FQN@', init_globals=None, run_name='__main__', alter_sys=False)

        # Modules exit on their own
        print('{"msg": "New-style module did not handle its own exit", "failed": true}')
        sys.exit(1)

    def debug(command, zipped_mod, json_params):
        # Keep the payload on the remote host, then:
        #   <interpreter> <payload> explode   unpack archive and args into debug_dir/
        #   <interpreter> <payload> execute   run the unpacked copy with its args file
        basedir = os.path.join(os.path.abspath(os.path.dirname(__file__)), 'debug_dir')
        args_path = os.path.join(basedir, 'args')

        if command == 'explode':
            z = zipfile.ZipFile(zipped_mod)
            for filename in z.namelist():
                if filename.startswith('/'):
                    raise Exception('Refusing to unpack absolute path %s' % filename)

                dest_filename = os.path.join(basedir, filename)
                if dest_filename.endswith(os.path.sep) and not os.path.exists(dest_filename):
                    os.makedirs(dest_filename)
                else:
                    directory = os.path.dirname(dest_filename)
                    if not os.path.exists(directory):
                        os.makedirs(directory)
                    with open(dest_filename, 'wb') as f:
                        f.write(z.read(filename))

            with open(args_path, 'wb') as f:
                f.write(json_params)

            print('Module expanded into:')
            print('%s' % basedir)
            return 0

        if command == 'execute':
            sys.path.insert(0, basedir)

            # the args file may have been edited
            with open(args_path, 'rb') as f:
                json_params = f.read()

            from @HELPER_NAMESPACE@ import basic
            basic._ANSIBLE_ARGS = json_params

            runpy.run_module(mod_name='@MODULE_FQN@', init_globals=None, run_name='__main__', alter_sys=False)

            print('{"msg": "New-style module did not handle its own exit", "failed": true}')
            sys.exit(1)

        print('WARNING: Unknown debug command.  Doing nothing.')
        return 0

    PARAMS = @PARAMS@
    if PY3:
        PARAMS = PARAMS.encode('utf-8')
    exitcode = 0
    temp_path = None
    try:
        # System temp dir: an async job can outlive the remote working dir
        temp_path = tempfile.mkdtemp(prefix='ansible_@MODULE_NAME@_payload_')

        zipped_mod = os.path.join(temp_path, 'ansible_@MODULE_NAME@_payload.zip')
        with open(zipped_mod, 'wb') as modlib:
            modlib.write(base64.b64decode(ZIPDATA))

        if len(sys.argv) == 2:
            exitcode = debug(sys.argv[1], zipped_mod, PARAMS)
        else:
            invoke_module(zipped_mod, PARAMS)
    finally:
        if temp_path is not None:
            shutil.rmtree(temp_path, ignore_errors=True)
    sys.exit(exitcode)

if __name__ == '__main__':
    _satchel_main()
"#;

const COVERAGE_TEMPLATE: &str = r#"
        # coverage needs a readable working directory
        try:
            os.getcwd()
        except OSError:
            os.chdir('/')

        os.environ['COVERAGE_FILE'] = @COVERAGE_OUTPUT@

        import atexit

        try:
            import coverage
        except ImportError:
            print('{"msg": "Could not import `coverage` module.", "failed": true}')
            sys.exit(1)

        cov = coverage.Coverage(config_file=@COVERAGE_CONFIG@)

        def atexit_coverage():
            cov.stop()
            cov.save()

        atexit.register(atexit_coverage)

        cov.start()
"#;

const COVERAGE_CHECK_TEMPLATE: &str = r#"
        try:
            if PY3:
                import importlib.util
                if importlib.util.find_spec('coverage') is None:
                    raise ImportError
            else:
                import imp
                imp.find_module('coverage')
        except ImportError:
            print('{"msg": "Could not find `coverage` module.", "failed": true}')
            sys.exit(1)
"#;

const RLIMIT_TEMPLATE: &str = r#"
    import resource

    existing_soft, existing_hard = resource.getrlimit(resource.RLIMIT_NOFILE)

    # never above the hard limit
    requested_soft = min(existing_hard, @RLIMIT_NOFILE@)

    if requested_soft != existing_soft:
        try:
            resource.setrlimit(resource.RLIMIT_NOFILE, (requested_soft, existing_hard))
        except ValueError:
            # some platforms report a hard limit they do not honour
            pass
"#;

/// Coverage instrumentation of the packed module, for test runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Coverage {
    #[default]
    Off,
    /// Only verify that `coverage` is importable on the remote host
    Check,
    Full { config: String, output: String },
}

impl Coverage {
    /// Decide from the two toggles. Without a config path nothing is emitted;
    /// with a config path but no output path only the cheap check is.
    pub fn from_toggles(config: Option<&str>, output: Option<&str>) -> Self {
        match (
            config.filter(|c| !c.is_empty()),
            output.filter(|o| !o.is_empty()),
        ) {
            (None, _) => Self::Off,
            (Some(_), None) => Self::Check,
            (Some(config), Some(output)) => Self::Full {
                config: config.to_owned(),
                output: output.to_owned(),
            },
        }
    }
}

/// Everything substituted into the loader.
#[derive(Debug, Clone)]
pub struct LoaderContext<'a> {
    pub shebang: &'a str,
    pub module_name: &'a str,
    pub module_fqn: &'a str,
    pub helper_namespace: &'a str,
    /// Python literal of the JSON arguments
    pub params_literal: &'a str,
    pub zipdata: &'a str,
    pub rlimit_nofile: Option<u64>,
    pub coverage: &'a Coverage,
    pub timestamp: DateTime<Utc>,
    /// Keep comment lines in the loader; otherwise they are stripped
    pub keep_comments: bool,
}

pub fn render_loader(ctx: &LoaderContext<'_>) -> String {
    let template = if ctx.keep_comments {
        LOADER_TEMPLATE.to_owned()
    } else {
        strip_comments(LOADER_TEMPLATE)
    };

    let rlimit = ctx.rlimit_nofile.map_or_else(String::new, |limit| {
        substitute(RLIMIT_TEMPLATE, |token| {
            (token == "RLIMIT_NOFILE").then(|| limit.to_string())
        })
    });
    let coverage = match ctx.coverage {
        Coverage::Off => String::new(),
        Coverage::Check => COVERAGE_CHECK_TEMPLATE.to_owned(),
        Coverage::Full { config, output } => substitute(COVERAGE_TEMPLATE, |token| match token {
            "COVERAGE_CONFIG" => Some(python_string_literal(config)),
            "COVERAGE_OUTPUT" => Some(python_string_literal(output)),
            _ => None,
        }),
    };

    let ts = ctx.timestamp;
    substitute(&template, |token| {
        let value = match token {
            "SHEBANG" => ctx.shebang.to_owned(),
            "CODING" => ENCODING_LINE.to_owned(),
            "RLIMIT" => rlimit.clone(),
            "COVERAGE" => coverage.clone(),
            "ZIPDATA" => ctx.zipdata.to_owned(),
            "PARAMS" => ctx.params_literal.to_owned(),
            "MODULE_FQN" => ctx.module_fqn.to_owned(),
            "MODULE_NAME" => ctx.module_name.to_owned(),
            "HELPER_NAMESPACE" => ctx.helper_namespace.to_owned(),
            "YEAR" => ts.year().to_string(),
            "MONTH" => ts.month().to_string(),
            "DAY" => ts.day().to_string(),
            "HOUR" => ts.hour().to_string(),
            "MINUTE" => ts.minute().to_string(),
            "SECOND" => ts.second().to_string(),
            _ => return None,
        };
        Some(value)
    })
}

/// Single pass, so substituted text is never itself scanned for tokens.
fn substitute(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    TOKEN
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}

fn strip_comments(source: &str) -> String {
    source
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Python `repr()` of a string.
pub fn python_string_literal(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
