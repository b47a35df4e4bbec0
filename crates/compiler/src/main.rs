//! MicroPascal compiler CLI
//!
//! `mpasc <mode> <input>` with one of four modes: `-l` token dump, `-p`
//! parse-tree dump, `-g` code generation, `-o` code generation plus peephole
//! optimization. The output lands next to the input with an `.asm` name;
//! compile errors are written there as a single diagnostic line and the
//! process exits unsuccessfully.

use clap::{ArgGroup, CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use mpasc::{CompilerConfig, Mode};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "mpasc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MicroPascal compiler - compile sources to 32-bit x86 assembly", long_about = None)]
#[command(group(ArgGroup::new("mode").args(["lex", "parse", "generate", "optimize"])))]
struct Cli {
    /// Dump tokens, one per line
    #[arg(short = 'l')]
    lex: bool,

    /// Dump the parse tree, then the symbol tables
    #[arg(short = 'p')]
    parse: bool,

    /// Generate assembly
    #[arg(short = 'g')]
    generate: bool,

    /// Generate assembly, then run the peephole optimizer
    #[arg(short = 'o')]
    optimize: bool,

    /// Input source file
    input: Option<PathBuf>,

    /// Output path (defaults to the input with an .asm name)
    #[arg(long)]
    output: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging to stderr
    #[arg(long)]
    verbose: bool,

    /// Generate shell completion scripts and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "mpasc", &mut io::stdout());
        return;
    }

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("mpasc=debug".parse().expect("static directive parses")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let mode = if cli.lex {
        Some(Mode::Lex)
    } else if cli.parse {
        Some(Mode::Parse)
    } else if cli.generate {
        Some(Mode::Generate)
    } else if cli.optimize {
        Some(Mode::Optimize)
    } else {
        None
    };

    let (Some(mode), Some(input)) = (mode, cli.input.as_deref()) else {
        println!("mpasc - MicroPascal compiler");
        return;
    };

    let config = match cli.config.as_deref() {
        Some(path) => match CompilerConfig::load(path) {
            Ok(config) => config,
            Err(message) => {
                eprintln!("{}", message);
                process::exit(1);
            }
        },
        None => CompilerConfig::default(),
    };

    match mpasc::compile_file(input, cli.output.as_deref(), mode, &config) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(_) => {
            // The input could not be opened (or the output not written).
            println!("Error opening file");
            process::exit(1);
        }
    }
}
