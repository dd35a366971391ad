//! On-disk report of an exploration: one JSON document per terminal state plus the
//! detector findings, and a short colored summary on stdout.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use colored::Colorize;
use serde::Serialize;

use crate::detectors::Finding;
use crate::engine::ExplorationResult;
use crate::error::AnalysisError;
use crate::solver::{Model, SatSolver};
use crate::symbolic::SymbolicState;

#[derive(Debug, Serialize)]
struct StateReport<'a> {
    function: &'a str,
    status: String,
    last_instruction: Option<String>,
    return_value: Option<String>,
    stack: Vec<String>,
    locals: Vec<Option<String>>,
    globals: Vec<Option<String>>,
    memory_pages: u32,
    // address -> byte, only bytes written on this path
    memory: Vec<(u32, String)>,
    constraints: Vec<String>,
    model: Option<Model>,
}

impl<'a> StateReport<'a> {
    fn new(function: &'a str, state: &SymbolicState, model: Option<Model>) -> Self {
        let render = |v: &Option<crate::symbolic::SymExpr>| v.as_ref().map(|v| v.to_string());
        Self {
            function,
            status: state.status.to_string(),
            last_instruction: state
                .last_instruction
                .as_ref()
                .map(|(offset, text)| format!("{offset:#x}: {text}")),
            return_value: render(&state.return_value),
            stack: state.stack.iter().map(|v| v.to_string()).collect(),
            locals: state.locals.iter().map(render).collect(),
            globals: state.globals.iter().map(render).collect(),
            memory_pages: state.memory.pages(),
            memory: state
                .memory
                .written()
                .map(|(addr, byte)| (addr, byte.to_string()))
                .collect(),
            constraints: state.constraints.iter().map(|c| c.to_string()).collect(),
            model,
        }
    }
}

// Symbols can contain `::`, `<` and the like.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), AnalysisError> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value).map_err(std::io::Error::from)?;
    Ok(())
}

/// `{out_dir}/{module}_{timestamp}/`
pub(crate) fn report_dir(out_dir: &Path, module: &str) -> PathBuf {
    let stamp = humantime::format_rfc3339_seconds(SystemTime::now())
        .to_string()
        .replace(':', "-");
    out_dir.join(format!("{}_{stamp}", file_safe(module)))
}

/// Write every terminal state and the findings below `dir`.
pub(crate) fn write_report(
    dir: &Path,
    result: &ExplorationResult,
    findings: &[Finding],
    solver: &mut dyn SatSolver,
) -> Result<usize, AnalysisError> {
    std::fs::create_dir_all(dir)?;
    let mut written = 0;
    for function in &result.functions {
        let stem = file_safe(&function.function);
        for (n, state) in function.states.iter().enumerate() {
            let model = solver.model(&state.constraints);
            let report = StateReport::new(&function.function, state, model);
            write_json(&dir.join(format!("state_{stem}_{n}.json")), &report)?;
            written += 1;
        }
    }
    write_json(&dir.join("findings.json"), &findings)?;
    tracing::info!(dir = %dir.display(), states = written, findings = findings.len(), "report written");
    Ok(written)
}

pub(crate) fn print_summary(result: &ExplorationResult, findings: &[Finding]) {
    for function in &result.functions {
        let stats = &function.stats;
        println!(
            "{} {}: {} terminal state(s) in {}",
            "[*]".cyan(),
            function.function.bold(),
            function.states.len(),
            humantime::format_duration(std::time::Duration::from_millis(
                function.elapsed.as_millis() as u64
            )),
        );
        println!(
            "    {} blocks emulated, {} loop(s) unrolled, {} cycle header(s), {} re-entries cut",
            stats.emulated_blocks, stats.unrolled_loops, stats.cycle_headers, stats.reentries
        );
        for state in &function.states {
            let status = state.status.to_string();
            let status = if state.status.is_running() {
                status.yellow()
            } else if matches!(state.status, crate::symbolic::StateStatus::Trapped(_)) {
                status.red()
            } else {
                status.green()
            };
            println!("    - {status} ({} constraints)", state.constraints.len());
        }
    }
    if findings.is_empty() {
        println!("{} no findings", "[+]".green());
        return;
    }
    println!("{} {} finding(s):", "[!]".red(), findings.len());
    for finding in findings {
        println!(
            "    {} in {} at {:#x} `{}`",
            finding.kind.to_string().red(),
            finding.function.bold(),
            finding.offset,
            finding.instruction
        );
        if let Some(model) = finding.model.as_ref().filter(|m| !m.is_empty()) {
            let assignment: Vec<String> = model.iter().map(|(k, v)| format!("{k} = {v}")).collect();
            println!("      with {}", assignment.join(", "));
        }
    }
}
