use std::path::Path;

use anyhow::Result;

use wasmparser::{FuncType, ValType};

use crate::ir::{ControlFlowGraph, ModuleSpec, detect_cycles};

pub(crate) fn run(program: Option<&Path>) -> Result<()> {
    print_build_info();
    if let Some(program) = program {
        println!();
        let (binary, spec) = super::parse_program(program)?;
        let cfg = ControlFlowGraph::from_module(&spec)?;
        check_program(&spec, &cfg, binary.len());
    }
    Ok(())
}

fn check_program(spec: &ModuleSpec, cfg: &ControlFlowGraph, binary_size: usize) {
    println!("Module summary for {:?}", spec.filename);
    println!(
        "  module size:   {}",
        humansize::format_size(binary_size, humansize::DECIMAL)
    );
    let imports = spec.functions.iter().filter(|f| f.is_import()).count();
    println!(
        "  functions:     {} ({imports} imported)",
        spec.functions.len()
    );
    println!(
        "  instructions:  {}",
        spec.functions
            .iter()
            .map(|f| f.instructions.len())
            .sum::<usize>(),
    );
    println!("  basic blocks:  {}", cfg.num_blocks());
    println!("  edges:         {}", cfg.num_edges());
    let mut loops = Vec::new();
    for func in cfg.functions() {
        let Ok(entry) = cfg.entry_block(func) else {
            continue;
        };
        let headers = detect_cycles(cfg, entry);
        let mut found: Vec<_> = headers.iter().collect();
        found.sort_by_key(|(name, _)| *name);
        for (header, edges) in found {
            loops.push((func, header.to_owned(), edges));
        }
    }
    println!("  cycle headers: {}", loops.len());
    for (func, header, edges) in &loops {
        let sig = cfg
            .signature_of(func)
            .map(signature)
            .unwrap_or_else(|_| "?".to_owned());
        println!(
            "    {func} {sig}: {header} (continue on {}, exit on {})",
            edges.continuation, edges.exit
        );
    }
    println!(
        "  memory:        {}",
        if spec.has_memory {
            humansize::format_size(
                spec.initial_mem_pages as u64 * crate::symbolic::WASM_PAGE_SIZE,
                humansize::BINARY,
            )
        } else {
            "none".to_owned()
        }
    );
    let float_globals = spec
        .globals
        .iter()
        .filter(|g| crate::emulator::value_width(&g.ty).is_none())
        .count();
    println!("  globals:       {} ({float_globals} unsupported)", spec.globals.len());

    let markers = ["[-]", "[+]"];
    println!("  entry points:");
    let mut exports: Vec<(&String, &u32)> = spec.exported_funcs.iter().collect();
    exports.sort_by_key(|(_, idx)| **idx);
    for (name, idx) in exports {
        let Some(func) = spec.functions.get(*idx as usize) else {
            continue;
        };
        // floats in the signature can't be modelled
        let supported = !func.is_import()
            && func
                .ty
                .params()
                .iter()
                .chain(func.ty.results())
                .all(|ty| crate::emulator::value_width(ty).is_some());
        println!("    {} `{name}`", markers[supported as usize]);
    }
}

fn signature(ty: &FuncType) -> String {
    let list = |tys: &[ValType]| {
        tys.iter()
            .map(|t| format!("{t:?}").to_lowercase())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("({}) -> ({})", list(ty.params()), list(ty.results()))
}

fn print_build_info() {
    let features: &[(bool, &'static str)] = &[
        (
            cfg!(feature = "compressed_harnesses"),
            "ZStandard-compressed modules (foo.wasm.zst)",
        ),
        (cfg!(feature = "solver_z3"), "Z3 solver backend"),
        (cfg!(feature = "with_mimalloc"), "mimalloc allocator"),
    ];
    println!("Compile-time features:");
    for (enabled, feature) in features {
        if *enabled {
            println!("  [+] {}", feature);
        } else {
            println!("  [-] {} (disabled)", feature);
        }
    }
    println!("Solvers:");
    println!("  [+] builtin (constant folding, unsigned ranges)");
    if cfg!(feature = "solver_z3") {
        println!("  [+] z3 (default)");
    }
}
