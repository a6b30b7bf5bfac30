//! Workspace automation tasks.
//!
//! Run with: `cargo xtask <command>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::Command;

/// Attributes every library crate root must carry.
const REQUIRED_LIB_ATTRS: [&str; 2] = ["#![forbid(unsafe_code)]", "#![deny(missing_docs)]"];

#[derive(Parser)]
#[command(name = "xtask", about = "Sieve workspace automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all CI checks locally
    Ci,
    /// Validate workspace conventions
    Lint,
    /// Generate coverage report
    Coverage,
    /// Re-run the concurrency suites to shake out coordination races
    Soak {
        /// Number of passes
        #[arg(long, default_value_t = 20)]
        iterations: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ci => run_ci(),
        Commands::Lint => run_lint(),
        Commands::Coverage => run_coverage(),
        Commands::Soak { iterations } => run_soak(iterations),
    }
}

fn run_ci() -> Result<()> {
    println!("Running CI checks...\n");

    run_lint()?;
    run_cmd("cargo", &["fmt", "--check"])?;
    run_cmd("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
    run_cmd("cargo", &["test", "--workspace"])?;
    run_cmd("cargo", &["doc", "--workspace", "--no-deps"])?;

    println!("\nAll CI checks passed!");
    Ok(())
}

fn run_lint() -> Result<()> {
    println!("Validating workspace conventions...\n");

    for entry in std::fs::read_dir("crates").context("reading crates/")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("sieve-") {
            anyhow::bail!("Crate '{name}' does not follow sieve-* naming");
        }
        check_lib_attrs(&entry.path().join("src/lib.rs"))?;
    }

    println!("All conventions validated!");
    Ok(())
}

fn check_lib_attrs(lib: &Path) -> Result<()> {
    let source = std::fs::read_to_string(lib)
        .with_context(|| format!("reading {}", lib.display()))?;
    for attr in REQUIRED_LIB_ATTRS {
        if !source.lines().any(|line| line.trim() == attr) {
            anyhow::bail!("{} is missing {attr}", lib.display());
        }
    }
    Ok(())
}

fn run_coverage() -> Result<()> {
    run_cmd("cargo", &["llvm-cov", "--workspace", "--html"])?;
    println!("\nCoverage report: target/llvm-cov/html/index.html");
    Ok(())
}

fn run_soak(iterations: u32) -> Result<()> {
    for pass in 1..=iterations {
        println!("Soak pass {pass}/{iterations}");
        run_cmd(
            "cargo",
            &["test", "-p", "sieve-flow", "--test", "concurrent_writers", "--quiet"],
        )?;
    }
    println!("\nNo races observed in {iterations} passes");
    Ok(())
}

fn run_cmd(cmd: &str, args: &[&str]) -> Result<()> {
    println!("$ {} {}", cmd, args.join(" "));
    let status = Command::new(cmd)
        .args(args)
        .status()
        .with_context(|| format!("Failed to run: {} {}", cmd, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", cmd, args.join(" "));
    }
    Ok(())
}
