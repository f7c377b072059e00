//! `yinc`: load a Universal AST from a file, project and run it on one of
//! the four CESK backends, and print the halted result.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};

use yin_core::AstNode;
use yin_runtime::{project, DatomIndex, ModuleRegistry};
use yin_vm::cesk::CeskVm;
use yin_vm::{datom_graph::DatomGraphVm, register, stack, tree_walk::TreeWalkVm};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Backend {
    Tree,
    Graph,
    Register,
    Stack,
}

/// Run a Yin program on a chosen CESK backend.
#[derive(Parser, Debug)]
#[command(name = "yinc", about = "Run a Universal AST program on a Yin VM backend")]
struct Cli {
    /// Path to a JSON-encoded Universal AST program.
    input: PathBuf,

    /// Which CESK backend to evaluate on.
    #[arg(short, long, value_enum, default_value_t = Backend::Tree)]
    backend: Backend,

    /// Emit a trace stream alongside the run (register backend only).
    #[arg(long, default_value_t = false)]
    trace: bool,

    /// Steps between register-file trace snapshots.
    #[arg(long, default_value_t = yin_vm::trace::DEFAULT_CADENCE)]
    trace_cadence: u64,

    /// Include raw values (not just type tags) in trace records.
    #[arg(long, default_value_t = false)]
    trace_raw: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("yinc=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        tracing::error!(error = %e, "run failed");
        eprintln!("yinc: {e}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let source = fs::read_to_string(&cli.input).map_err(|e| format!("reading {:?}: {e}", cli.input))?;
    let ast: AstNode = serde_json::from_str(&source).map_err(|e| format!("parsing {:?}: {e}", cli.input))?;

    tracing::info!(backend = ?cli.backend, path = ?cli.input, "loaded program");

    let projection = project(&ast, 0);

    match cli.backend {
        Backend::Tree => {
            let mut vm = TreeWalkVm::new(ModuleRegistry::with_core_primitives());
            vm.load_program(ast).map_err(|e| e.to_string())?;
            vm.eval().map_err(|e| e.to_string())?;
            report(&vm)
        }
        Backend::Graph => {
            let mut vm = DatomGraphVm::new(ModuleRegistry::with_core_primitives());
            vm.load_program((projection.datoms, projection.root)).map_err(|e| e.to_string())?;
            vm.eval().map_err(|e| e.to_string())?;
            report(&vm)
        }
        Backend::Register => {
            let idx = DatomIndex::build(&projection.datoms);
            let symbolic = register::compiler::compile(&idx, projection.root).map_err(|e| e.to_string())?;
            let bytecode = register::bytecode::assemble(&symbolic);
            let mut vm = register::RegisterVm::new(ModuleRegistry::with_core_primitives());
            if cli.trace {
                vm.enable_trace(cli.trace_cadence, cli.trace_raw);
            }
            vm.load_program(bytecode).map_err(|e| e.to_string())?;
            vm.eval().map_err(|e| e.to_string())?;
            if let Some(stream) = vm.trace_stream() {
                tracing::info!(?stream, "trace events recorded to this stream");
            }
            report(&vm)
        }
        Backend::Stack => {
            let idx = DatomIndex::build(&projection.datoms);
            let symbolic = stack::compiler::compile(&idx, projection.root).map_err(|e| e.to_string())?;
            let bytecode = stack::bytecode::assemble(&symbolic);
            let mut vm = stack::StackVm::new(ModuleRegistry::with_core_primitives());
            vm.load_program(bytecode).map_err(|e| e.to_string())?;
            vm.eval().map_err(|e| e.to_string())?;
            report(&vm)
        }
    }
}

fn report<V: CeskVm>(vm: &V) -> Result<(), String> {
    if vm.blocked() {
        return Err(format!(
            "program parked with nothing left runnable (control={}, continuation={})",
            vm.control_repr(),
            vm.continuation_repr()
        ));
    }
    match vm.value() {
        Some(v) => {
            println!("{v:?}");
            Ok(())
        }
        None => Err("halted with no value".to_string()),
    }
}
