use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use xtella::ast::Program;
use xtella::{Value, Vm, VmOptions, codegen, compile};

#[derive(Parser)]
#[command(name = "xtella", version, about = "Compile and run an Xtella syntax tree")]
struct Cli {
    /// Syntax tree as JSON, as handed over by the parser
    tree: PathBuf,

    /// Print the compiled program instead of running it
    #[arg(long, value_enum)]
    emit: Option<Emit>,

    /// Frame-stack limit per execution context
    #[arg(long, default_value_t = VmOptions::default().max_frames)]
    max_frames: usize,

    /// -v for debug logs, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Listing,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let source = match std::fs::read_to_string(&cli.tree) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", cli.tree.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let program: Program = match serde_json::from_str(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Invalid syntax tree in {}: {}", cli.tree.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let compiled = match compile(&program) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Compile error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(Emit::Listing) = cli.emit {
        print!("{}", codegen::listing(&compiled));
        return ExitCode::SUCCESS;
    }

    let vm = Vm::with_options(compiled, VmOptions { max_frames: cli.max_frames });
    match vm.run() {
        Ok(Value::Unit) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(fault) => {
            eprintln!("Runtime fault: {}", fault);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the verbosity flag picks the level.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "xtella=warn",
        1 => "xtella=debug",
        _ => "xtella=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
