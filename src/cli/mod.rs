use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::detectors::{detectors_for, run_detectors};
use crate::emulator::WasmEmulator;
use crate::engine::{
    Automatic, ExplorationContext, ExplorationPolicy, ExplorationResult, Guided, StdinPrompt,
    explore,
};
use crate::ir::{ControlFlowGraph, ModuleSpec};
use crate::solver::new_solver;

mod doctor;

#[derive(Parser)]
#[clap(version, about = "Bounded symbolic exploration of WebAssembly modules")]
pub(crate) struct Opts {
    // -v: debug, -vv: trace. `RUST_LOG` takes precedence.
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[clap(subcommand)]
    subcmd: Subcommand,
}

#[derive(Parser)]
pub(crate) enum Subcommand {
    /// Explore the paths of one or more functions and report their terminal states.
    Explore {
        program: PathBuf,
        // Entry functions by name or export name (default: every exported function)
        #[clap(long = "entry", short = 'e')]
        entries: Vec<String>,
        // Reports land in `{out_dir}/{module}_{timestamp}/`
        #[clap(long, default_value = "output")]
        out_dir: PathBuf,
        // Only print the summary
        #[clap(long)]
        no_report: bool,
        #[clap(flatten)]
        config: EngineConfig,
    },
    /// Check the build configuration and summarize a WebAssembly module.
    Doctor { program: Option<PathBuf> },
    /// Print a function's basic blocks as a Graphviz digraph.
    DumpCfg { program: PathBuf, function: String },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// Raw module bytes and the decoded module.
fn parse_program(path: &Path) -> Result<(Vec<u8>, ModuleSpec)> {
    // Note: `wat::parse_file` also handles .wasm files
    #[cfg(feature = "compressed_harnesses")]
    let module_binary = if path.extension() == Some(std::ffi::OsStr::new("zst")) {
        let data = std::fs::read(path).with_context(|| format!("reading {path:?}"))?;
        zstd::decode_all(data.as_slice()).context("decompressing module")?
    } else {
        wat::parse_file(path)?
    };
    #[cfg(not(feature = "compressed_harnesses"))]
    let module_binary = wat::parse_file(path)?;

    use wasmparser::WasmFeatures;
    let features = WasmFeatures::SATURATING_FLOAT_TO_INT
        | WasmFeatures::SIGN_EXTENSION
        | WasmFeatures::MULTI_VALUE
        | WasmFeatures::BULK_MEMORY
        | WasmFeatures::FLOATS
        | WasmFeatures::MUTABLE_GLOBAL
        | WasmFeatures::REFERENCE_TYPES;
    wasmparser::Validator::new_with_features(features)
        .validate_all(&module_binary)
        .context("wasm file is using unsupported feature proposals")?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("module.wasm");
    let spec = ModuleSpec::parse(filename, &module_binary)?;
    Ok((module_binary, spec))
}

/// Map requested names (function names or export names) to CFG function identifiers.
fn resolve_entries(
    module: &ModuleSpec,
    cfg: &ControlFlowGraph,
    requested: &[String],
) -> Result<Vec<String>> {
    if requested.is_empty() {
        let mut exported: Vec<u32> = module.exported_funcs.values().copied().collect();
        exported.sort_unstable();
        exported.dedup();
        let entries: Vec<String> = exported
            .into_iter()
            .filter_map(|idx| module.functions.get(idx as usize))
            .filter(|func| !func.is_import())
            .map(|func| func.symbol.clone())
            .collect();
        if entries.is_empty() {
            bail!("module exports no functions, pass one with --entry");
        }
        return Ok(entries);
    }
    let known: Vec<&str> = cfg.functions().collect();
    requested
        .iter()
        .map(|name| {
            if known.contains(&name.as_str()) {
                return Ok(name.clone());
            }
            module
                .exported_funcs
                .get(name)
                .and_then(|idx| module.functions.get(*idx as usize))
                .filter(|func| !func.is_import())
                .map(|func| func.symbol.clone())
                .with_context(|| format!("no function or export named `{name}`"))
        })
        .collect()
}

fn run_explore(
    program: &Path,
    entries: &[String],
    out_dir: &Path,
    no_report: bool,
    config: &EngineConfig,
) -> Result<()> {
    let (_, module) = parse_program(program)?;
    let cfg = ControlFlowGraph::from_module(&module)?;
    let entries = resolve_entries(&module, &cfg, entries)?;
    let emulator = WasmEmulator::new(&module, config);
    let ctx = ExplorationContext {
        cfg: &cfg,
        emulator: &emulator,
        config,
    };
    tracing::info!(
        module = %module.filename,
        entries = ?entries,
        loop_bound = config.loop_bound,
        guided = config.guided,
        detectors = ?config.detectors,
        "starting exploration"
    );

    let start = Instant::now();
    let mut automatic = None;
    let mut guided = None;
    let policy: &mut dyn ExplorationPolicy = if config.guided {
        guided.insert(Guided::new(StdinPrompt))
    } else {
        let policy = automatic.insert(Automatic::new(new_solver(config)?));
        tracing::info!(solver = policy.solver_name(), "pruning infeasible branches");
        policy
    };
    let result: ExplorationResult = explore(&ctx, policy, &entries)?;
    tracing::info!(
        states = result.num_states(),
        elapsed = %humantime::format_duration(start.elapsed()),
        "exploration done"
    );

    // detectors and the report get their own solver instance
    let mut solver = new_solver(config)?;
    let states = result
        .functions
        .iter()
        .flat_map(|f| f.states.iter().map(move |s| (f.function.as_str(), s)));
    let findings = run_detectors(&detectors_for(&config.detectors), states, solver.as_mut());
    if let Some(automatic) = &automatic {
        tracing::info!(
            queries = automatic.queries(),
            pruned = automatic.pruned(),
            "solver statistics"
        );
    }
    crate::report::print_summary(&result, &findings);

    if !no_report {
        let dir = crate::report::report_dir(out_dir, &module.filename);
        crate::report::write_report(&dir, &result, &findings, solver.as_mut())?;
        println!("{} report written to {}", "[*]".cyan(), dir.display());
    }
    Ok(())
}

fn run_dump_cfg(program: &Path, function: &str) -> Result<()> {
    let (_, module) = parse_program(program)?;
    let cfg = ControlFlowGraph::from_module(&module)?;
    let entries = resolve_entries(&module, &cfg, &[function.to_owned()])?;
    for entry in entries {
        print!("{}", cfg.to_dot(&entry)?);
    }
    Ok(())
}

pub(crate) fn main() -> Result<()> {
    let opts: Opts = Opts::parse();
    init_logging(opts.verbose);

    match opts.subcmd {
        Subcommand::Explore {
            program,
            entries,
            out_dir,
            no_report,
            config,
        } => run_explore(&program, &entries, &out_dir, no_report, &config),
        Subcommand::Doctor { program } => doctor::run(program.as_deref()),
        Subcommand::DumpCfg { program, function } => run_dump_cfg(&program, &function),
    }
}
