//! procfan CLI binary
//!
//! Runs one command under the procfan supervisor and copies its streams to
//! the terminal.

use clap::{Args, Parser, Subcommand};
use procfan_cli::{check_config, resolve_config, run_process, Console, Overrides};
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "procfan")]
#[command(about = "Run a command with supervised, fanned-out stdio streams")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and print its output
    Run(RunArgs),
    /// Validate a process config file
    Check {
        /// Path to a TOML process config
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to a TOML process config
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Forward this terminal's stdin to the child
    #[arg(long)]
    stdin: bool,

    /// Do not capture stdout
    #[arg(long)]
    no_stdout: bool,

    /// Do not capture stderr
    #[arg(long)]
    no_stderr: bool,

    /// Longest wait for the child during shutdown, in milliseconds (0 = unbounded)
    #[arg(long, value_name = "MS")]
    max_wait_ms: Option<u64>,

    /// Start the child in its own process group
    #[arg(long)]
    process_group: bool,

    /// Prefix each line with the stream it came from
    #[arg(long)]
    prefix: bool,

    /// Command to run, after `--`
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = procfan_core::utils::init_tracing(&cli.log_level) {
        eprintln!("{}", e);
    }

    let code = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { config } => match check_config(&config) {
            Ok(summary) => {
                println!("{}", summary);
                0
            }
            Err(e) => {
                error!("[{}] {}", e.code(), e);
                eprintln!("{}", e);
                1
            }
        },
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    let overrides = Overrides {
        command: args.command,
        stdin: args.stdin,
        no_stdout: args.no_stdout,
        no_stderr: args.no_stderr,
        max_wait_ms: args.max_wait_ms,
        process_group: args.process_group,
    };
    let config = match resolve_config(args.config.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };

    let console = Console {
        stdout: tokio::io::stdout(),
        stderr: tokio::io::stderr(),
        prefix: args.prefix,
    };
    let input = config.stdin.then(tokio::io::stdin);
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match run_process(config, console, input, ctrl_c).await {
        Ok(code) => code,
        Err(e) => {
            error!("[{}] {}", e.code(), e);
            eprintln!("{}", e);
            1
        }
    }
}
