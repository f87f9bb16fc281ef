//! Workspace tasks for rune-deploy
//!
//! ```bash
//! cargo xtask check      # fmt check, clippy, tests
//! cargo xtask demo       # validate and plan demos/compose.yaml
//! cargo xtask release    # checks, then an optimized build
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use xshell::{cmd, Shell};

const DEMO_DESCRIPTOR: &str = "demos/compose.yaml";
const DEMO_ENV: &str = "demos/.env.example";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Workspace tasks for rune-deploy")]
struct Cli {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Formatting check, clippy with warnings denied, and the test suite
    Check,
    /// Rewrite sources with rustfmt
    Fmt,
    /// Validate the demo stack, then plan it against an empty state directory
    Demo,
    /// Run `check`, then build the release binary
    Release,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.task {
        Task::Check => check(&sh),
        Task::Fmt => {
            cmd!(sh, "cargo fmt --all").run()?;
            Ok(())
        }
        Task::Demo => demo(&sh),
        Task::Release => {
            check(&sh)?;
            println!("🔨 Building release binary...");
            cmd!(sh, "cargo build --release --bin rune-deploy").run()?;
            println!("✅ target/release/rune-deploy is ready");
            Ok(())
        }
    }
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("cargo locate-project failed")?;

    let manifest = PathBuf::from(String::from_utf8(output.stdout)?.trim());
    manifest
        .parent()
        .map(|dir| dir.to_path_buf())
        .context("workspace manifest has no parent directory")
}

fn check(sh: &Shell) -> Result<()> {
    println!("🎨 rustfmt");
    cmd!(sh, "cargo fmt --all -- --check").run()?;

    println!("🔍 clippy");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;

    println!("🧪 tests");
    cmd!(sh, "cargo test --workspace").run()?;

    println!("✅ Checks passed");
    Ok(())
}

fn demo(sh: &Shell) -> Result<()> {
    let scratch = sh.create_temp_dir()?;
    let state_dir = scratch.path();

    println!("🧭 Validating {}", DEMO_DESCRIPTOR);
    cmd!(
        sh,
        "cargo run --quiet --bin rune-deploy -- --env-file {DEMO_ENV} validate {DEMO_DESCRIPTOR}"
    )
    .run()?;

    println!("🧭 Planning against {}", state_dir.display());
    cmd!(
        sh,
        "cargo run --quiet --bin rune-deploy -- --env-file {DEMO_ENV} --state-dir {state_dir} plan {DEMO_DESCRIPTOR}"
    )
    .run()?;

    Ok(())
}
