//! Bounded symbolic exploration of WebAssembly modules.
//!
//! A module is decoded into per-function basic blocks, then every path from an
//! entry function's first block is emulated over symbolic values. Branches fork the
//! path state, infeasible branches are pruned with an SMT solver and loops are
//! unrolled a bounded number of times.

mod cli;
mod config;
mod detectors;
mod emulator;
mod engine;
mod error;
mod ir;
mod report;
mod solver;
mod symbolic;

pub(crate) use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

#[cfg(test)]
mod tests;

#[cfg(feature = "with_mimalloc")]
mod with_mimalloc {
    #[global_allocator]
    static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
}

fn main() -> anyhow::Result<()> {
    cli::main()
}
