use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use log::{LevelFilter, info};
use satchel::{
    ModuleName, ModulePayloadRequest, PayloadBuilder,
    args::ModuleArgs,
    config::{Config, coverage_from_env},
    orchestrator::derive_module_fqn,
    templar::StaticVars,
    types::Compression,
};

#[derive(Debug, Parser)]
#[command(
    name = "satchel",
    version,
    about = "Pack a Python module and the helpers it imports into one payload"
)]
struct Cli {
    /// Config file to use instead of the discovered one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the payload of a module
    Build {
        /// Module source file
        module: PathBuf,

        /// Short module name; defaults to the file stem
        #[arg(long)]
        name: Option<String>,

        /// Fully qualified module name; derived from the path when omitted
        #[arg(long)]
        module_name: Option<String>,

        /// Module arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Host variable as name=value, may be repeated
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Archive compression (ZIP_STORED or ZIP_DEFLATED)
        #[arg(long)]
        compression: Option<Compression>,

        /// Write the payload here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Build the archive without reading or writing the cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Print the dispatch style of a module
    Classify {
        /// Module source file
        module: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Build {
            module,
            name,
            module_name,
            args,
            vars,
            compression,
            output,
            no_cache,
        } => {
            let options = BuildOptions {
                name,
                module_name,
                args,
                vars,
                compression,
                no_cache,
            };
            let payload = build(&config, &module, options)?;
            write_output(output.as_deref(), &payload)
        }
        Commands::Classify { module } => {
            let source = read_module(&module)?;
            let builder = payload_builder(&config)?;
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", builder.classify(&source))?;
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

#[derive(Debug)]
struct BuildOptions {
    name: Option<String>,
    module_name: Option<String>,
    args: String,
    vars: Vec<String>,
    compression: Option<Compression>,
    no_cache: bool,
}

fn build(config: &Config, module: &Path, options: BuildOptions) -> Result<Vec<u8>> {
    config.require_helper_paths()?;
    let source = read_module(module)?;
    let name = match options.name {
        Some(name) => name,
        None => module
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("cannot derive a module name from {}", module.display()))?,
    };
    let module_fqn = match options.module_name.as_deref() {
        Some(dotted) => ModuleName::parse(dotted),
        None => derive_module_fqn(module, &name),
    };
    let args: ModuleArgs =
        serde_json::from_str(&options.args).context("Module arguments must be a JSON object")?;
    let vars = options
        .vars
        .iter()
        .map(|assignment| {
            StaticVars::parse_assignment(assignment)
                .ok_or_else(|| anyhow!("invalid variable '{assignment}', expected NAME=VALUE"))
        })
        .collect::<Result<StaticVars>>()?;

    let mut builder = payload_builder(config)?;
    if !options.no_cache {
        builder = builder.with_cache(config.build_cache());
    }

    let payload = builder.build(&ModulePayloadRequest {
        module_name: &name,
        module_fqn,
        source: &source,
        args: &args,
        compression: options.compression,
        vars: &vars,
    })?;
    info!(
        "{name}: {} bytes, style {}, interpreter {}",
        payload.bytes.len(),
        payload.style,
        payload.shebang.as_deref().unwrap_or("none")
    );
    Ok(payload.bytes)
}

fn payload_builder(config: &Config) -> Result<PayloadBuilder> {
    let settings = config.build_settings(coverage_from_env());
    PayloadBuilder::new(settings, config.source_store())
        .context("Failed to compile the module classification patterns")
}

fn read_module(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read module {}", path.display()))
}

fn write_output(output: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => fs::write(path, bytes)
            .with_context(|| format!("Failed to write payload to {}", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}
