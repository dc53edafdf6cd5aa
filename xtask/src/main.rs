//! Build automation tasks for natpunch
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

/// Fuzz targets under `fuzz/`
const FUZZ_TARGETS: &[&str] = &[
    "fuzz_stun_message",
    "fuzz_holepunch_message",
    "fuzz_punch_packet",
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "natpunch build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run codec benchmarks
    Bench,

    /// Run each fuzz target for a bounded time (requires cargo-fuzz and nightly)
    Fuzz {
        /// Seconds per target
        #[arg(long, default_value = "60")]
        seconds: u64,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command(
                "cargo",
                &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
            )?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command(
                "cargo",
                &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
            )?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench => {
            run_command(
                "cargo",
                &["bench", "-p", "natpunch-integration-tests", "--bench", "codec"],
            )?;
        }
        Commands::Fuzz { seconds } => {
            let max_time = format!("-max_total_time={seconds}");
            for target in FUZZ_TARGETS {
                println!("Fuzzing {target} for {seconds}s...");
                run_command(
                    "cargo",
                    &["+nightly", "fuzz", "run", "--fuzz-dir", "fuzz", target, "--", &max_time],
                )?;
            }
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
