use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "tlstap";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, run and package tlstap")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the eBPF object and the userspace binary
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the binary under sudo
    Run {
        #[arg(long)]
        release: bool,

        /// PIDs whose namespaces should be traced
        #[arg(long = "pid")]
        pids: Vec<u32>,

        /// Extra environment assignments passed through sudo (KEY=VALUE)
        #[arg(long = "env")]
        envs: Vec<String>,
    },

    /// Build a release tarball
    Package {
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Run {
            release,
            pids,
            envs,
        } => {
            run(release, &pids, &envs)?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live one level below the workspace root")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    match target {
        Some(t) => root.join("target").join(t).join(profile).join(BINARY),
        None => root.join("target").join(profile).join(BINARY),
    }
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("🔨 Building {}...", BINARY);

    // Linux targets from a non-Linux host go through `cross`
    let is_cross_compile =
        target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross'.\n\
                 Install with: cargo install cross"
            );
        }
        println!("   Using 'cross' for cross-compilation");
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let path = binary_path(&root, release, target);
    println!("✅ Build complete: {}", path.display());
    Ok(path)
}

fn run(release: bool, pids: &[u32], envs: &[String]) -> Result<()> {
    let binary = build(release, None)?;

    for assignment in envs {
        if !assignment.contains('=') {
            bail!("Expected KEY=VALUE, got '{}'", assignment);
        }
    }

    let mut cmd = Command::new("sudo");
    cmd.arg("-E");
    // `sudo -E VAR=x cmd` form
    cmd.args(envs);
    cmd.arg(&binary);
    for pid in pids {
        cmd.arg("--pid").arg(pid.to_string());
    }
    if let Ok(level) = env::var("RUST_LOG") {
        cmd.env("RUST_LOG", level);
    }

    let status = cmd.status().context("Failed to run sudo")?;
    if !status.success() {
        bail!("{} exited with {}", BINARY, status);
    }
    Ok(())
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output_path = root.join(output_dir);
    fs::create_dir_all(&output_path).context("Failed to create output directory")?;

    let arch = target.unwrap_or(env::consts::ARCH);
    let package_name = format!("{}-{}-{}", BINARY, env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir)?;

    fs::copy(&binary, package_dir.join(BINARY))?;
    let env_example = root.join("example.env");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join("tlstap.env.example"))?;
    }

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;
    println!("✅ Package created: {}", tarball.display());
    Ok(())
}
