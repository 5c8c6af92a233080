//! Lenity CLI: load a JSON program and run, disassemble or verify it.

use clap::{Parser as ClapParser, Subcommand};
use lenity_cli::colors::{bold, gray, green, red, status_label, yellow};
use lenity_cli::commands::{self, CliError};
use lenity_cli::config::{LenityConfig, CONFIG_FILE};
use lenity_core::Program;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "lenity", version, about = "A lenient bytecode interpreter")]
struct Cli {
    /// Use this config file instead of searching for lenity.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an entry procedure of a JSON program
    Run {
        /// Path to the program JSON
        #[arg()]
        file: PathBuf,

        /// Entry procedure name
        #[arg(long, default_value = "main")]
        entry: String,

        /// Argument passed to the entry procedure (JSON number, string or bool)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Give up after this many executed ops
        #[arg(long)]
        max_instructions: Option<u64>,

        /// Log every executed op
        #[arg(long)]
        trace: bool,
    },
    /// Print the disassembly of every procedure
    Disasm {
        #[arg()]
        file: PathBuf,
    },
    /// Check a program without running it
    Verify {
        #[arg()]
        file: PathBuf,
    },
    /// Create a lenity.toml config file in the current directory
    Init,
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Commands::Run {
            file,
            entry,
            args,
            max_instructions,
            trace,
        } => {
            let mut config = config;
            if max_instructions.is_some() {
                config.vm.max_instructions = max_instructions;
            }
            if trace {
                config.vm.trace_execution = true;
                config.log.filter = Some("lenity_vm=trace".to_string());
            }
            init_tracing(config.log_filter());
            cmd_run(&file, &entry, &args, config)
        }
        Commands::Disasm { file } => {
            init_tracing(config.log_filter());
            cmd_disasm(&file)
        }
        Commands::Verify { file } => {
            init_tracing(config.log_filter());
            cmd_verify(&file)
        }
        Commands::Init => cmd_init(),
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(explicit: Option<&Path>) -> LenityConfig {
    let loaded = match explicit {
        Some(path) => LenityConfig::load_from(path),
        None => LenityConfig::load(),
    };
    loaded.unwrap_or_else(|e| {
        eprintln!("{} {}", red("error:"), e);
        std::process::exit(1);
    })
}

fn fail(e: CliError) -> ! {
    eprintln!("{} {}", red("error:"), e);
    std::process::exit(1);
}

fn read_program(file: &Path) -> Program {
    commands::load_program(file).unwrap_or_else(|e| fail(e))
}

fn cmd_run(file: &Path, entry: &str, args: &[String], config: LenityConfig) {
    let program = read_program(file);
    let args = args
        .iter()
        .map(|a| commands::parse_arg(a))
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_else(|e| fail(e));

    eprintln!("{} {}", status_label("Running"), entry);
    let report = commands::run(program, entry, args, config.vm).unwrap_or_else(|e| fail(e));
    for line in &report.output {
        println!("{}", line);
    }
    if report.parked_tasks > 0 {
        eprintln!("{} {} task(s) still suspended", gray("note:"), report.parked_tasks);
    }
    match report.result {
        Some(result) if report.pending => {
            println!("{} {}", result, gray("(unresolved)"));
        }
        Some(result) => println!("{}", result),
        None => {
            eprintln!("{} {} failed", yellow("failure:"), bold(entry));
            std::process::exit(2);
        }
    }
}

fn cmd_disasm(file: &Path) {
    let program = read_program(file);
    print!("{}", commands::disassemble(&program));
}

fn cmd_verify(file: &Path) {
    let program = read_program(file);
    let count = commands::verify(&program).unwrap_or_else(|e| fail(e));
    println!(
        "{} {} {}",
        green("✓"),
        bold(&file.display().to_string()),
        gray(&format!("{} procedure(s) verified", count))
    );
}

fn cmd_init() {
    let path = PathBuf::from(CONFIG_FILE);
    if path.exists() {
        eprintln!("{} {} already exists, not overwriting", red("error:"), CONFIG_FILE);
        std::process::exit(1);
    }
    std::fs::write(&path, LenityConfig::default_template()).unwrap_or_else(|e| {
        eprintln!("{} writing {}: {}", red("error:"), CONFIG_FILE, e);
        std::process::exit(1);
    });
    println!("{} {}", status_label("Created"), CONFIG_FILE);
}
