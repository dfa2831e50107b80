use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const LAMBDA_PACKAGE: &str = "marker_backfill_lambda";
const LAMBDA_BINARY: &str = "migrate_lambda";
const BOOTSTRAP_ENTRY: &str = "bootstrap";
const DIST_DIR: &str = "infra/marker_backfill/dist";
const ELF_MAGIC: &[u8] = b"\x7fELF";

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the marker backfill workspace",
    long_about = "Packages the migration Lambda, runs local migration passes,\n\
                  and runs CI checks for the marker backfill workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the migration Lambda and package it as a `bootstrap` zip
    LambdaPackage {
        /// Lambda architecture the binary is built for
        #[arg(value_enum, long, default_value_t = LambdaArch::X86_64)]
        arch: LambdaArch,
        /// Build profile used for the binary
        #[arg(value_enum, long, default_value_t = BuildProfile::Release)]
        profile: BuildProfile,
    },
    /// Run migration passes from this machine (arguments go to migrate_local)
    Migrate {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run CI checks
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting and clippy
    Lint,
    /// Workspace tests
    Test,
    /// Lint + test
    Check,
}

/// Architectures offered by the `provided.al2023` runtime.
#[derive(Clone, Copy, ValueEnum)]
enum LambdaArch {
    #[value(name = "x86_64")]
    X86_64,
    Arm64,
}

impl LambdaArch {
    fn target_triple(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64-unknown-linux-gnu",
            Self::Arm64 => "aarch64-unknown-linux-gnu",
        }
    }

    fn artifact_suffix(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildProfile {
    Debug,
    Release,
}

impl BuildProfile {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn fail(message: String) -> ! {
    eprintln!("error: {message}");
    exit(1);
}

// ── lambda packaging ───────────────────────────────────────────────

fn package_migration_lambda(arch: LambdaArch, profile: BuildProfile) {
    let triple = arch.target_triple();
    if let Err(message) = check_target_installed(triple) {
        fail(message);
    }

    step("Build migration lambda binary");
    let mut build_args = vec!["build", "-p", LAMBDA_PACKAGE, "--bin", LAMBDA_BINARY];
    build_args.extend(["--target", triple]);
    if matches!(profile, BuildProfile::Release) {
        build_args.push("--release");
    }
    run_cargo(&build_args);

    step("Package lambda zip artifact");
    let binary_path = Path::new("target")
        .join(triple)
        .join(profile.dir_name())
        .join(LAMBDA_BINARY);
    let zip_path = Path::new(DIST_DIR).join(format!(
        "{LAMBDA_BINARY}-{}.zip",
        arch.artifact_suffix()
    ));

    let packaged = read_linux_binary(&binary_path)
        .and_then(|binary| write_bootstrap_zip(&binary, &zip_path));
    match packaged {
        Ok(bytes) => eprintln!("\nPackaged {} ({bytes} bytes)", zip_path.display()),
        Err(message) => fail(message),
    }
}

/// Skips the check when rustup is not on PATH (e.g. distro-packaged rustc);
/// cargo reports a missing target itself in that case.
fn check_target_installed(triple: &str) -> Result<(), String> {
    let Ok(output) = Command::new("rustup")
        .args(["target", "list", "--installed"])
        .output()
    else {
        eprintln!("warning: rustup not found; not checking for target `{triple}`");
        return Ok(());
    };

    let installed = String::from_utf8_lossy(&output.stdout);
    if installed.lines().any(|line| line.trim() == triple) {
        Ok(())
    } else {
        Err(format!(
            "target `{triple}` is not installed; run `rustup target add {triple}`"
        ))
    }
}

/// The custom runtime executes `bootstrap` directly, so anything other than
/// an ELF executable would fail at cold start.
fn read_linux_binary(path: &Path) -> Result<Vec<u8>, String> {
    let binary =
        fs::read(path).map_err(|error| format!("failed to read {}: {error}", path.display()))?;
    if !binary.starts_with(ELF_MAGIC) {
        return Err(format!("{} is not a Linux ELF executable", path.display()));
    }
    Ok(binary)
}

/// Writes the zip and re-opens it to confirm the `bootstrap` entry is intact.
/// Returns the artifact size.
fn write_bootstrap_zip(binary: &[u8], zip_path: &Path) -> Result<u64, String> {
    let zip_error = |error: zip::result::ZipError| format!("{}: {error}", zip_path.display());
    if let Some(dir) = zip_path.parent() {
        fs::create_dir_all(dir)
            .map_err(|error| format!("failed to create {}: {error}", dir.display()))?;
    }

    let file = fs::File::create(zip_path)
        .map_err(|error| format!("failed to create {}: {error}", zip_path.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);
    writer.start_file(BOOTSTRAP_ENTRY, options).map_err(zip_error)?;
    writer
        .write_all(binary)
        .map_err(|error| format!("failed to write {BOOTSTRAP_ENTRY}: {error}"))?;
    writer.finish().map_err(zip_error)?;

    let file = fs::File::open(zip_path)
        .map_err(|error| format!("failed to reopen {}: {error}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).map_err(zip_error)?;
    if archive.len() != 1 {
        return Err(format!("{} should hold only {BOOTSTRAP_ENTRY}", zip_path.display()));
    }
    let entry = archive.by_name(BOOTSTRAP_ENTRY).map_err(zip_error)?;
    if entry.size() != binary.len() as u64 {
        return Err(format!(
            "{BOOTSTRAP_ENTRY} in {} is {} bytes, expected {}",
            zip_path.display(),
            entry.size(),
            binary.len()
        ));
    }
    drop(entry);

    fs::metadata(zip_path)
        .map(|metadata| metadata.len())
        .map_err(|error| format!("failed to stat {}: {error}", zip_path.display()))
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_lint() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);
}

fn ci_test() {
    step("Test marker_backfill_core");
    run_cargo(&["test", "-p", "marker_backfill_core"]);

    step("Test marker_backfill_lambda");
    run_cargo(&["test", "-p", LAMBDA_PACKAGE]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::LambdaPackage { arch, profile } => {
            package_migration_lambda(arch, profile);
        }
        Commands::Migrate { args } => {
            let mut cargo_args = vec!["run", "-p", LAMBDA_PACKAGE, "--bin", "migrate_local", "--"];
            cargo_args.extend(args.iter().map(String::as_str));
            run_cargo(&cargo_args);
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Lint => ci_lint(),
                CiJob::Test => ci_test(),
                CiJob::Check => {
                    ci_lint();
                    ci_test();
                }
            }
            eprintln!("\nCI job passed.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("xtask-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("scratch dir should be created");
        dir
    }

    #[test]
    fn bootstrap_zip_holds_the_binary_under_bootstrap() {
        let dir = scratch_dir("zip");
        let binary = [ELF_MAGIC, b"rest of the executable".as_slice()].concat();
        let zip_path = dir.join("dist").join("migrate_lambda-x86_64.zip");

        let size = write_bootstrap_zip(&binary, &zip_path).expect("zip should be written");

        assert!(size > 0);
        let mut archive =
            ZipArchive::new(fs::File::open(&zip_path).expect("zip should open")).expect("archive");
        let mut entry = archive.by_name("bootstrap").expect("bootstrap entry");
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).expect("entry should read");
        assert_eq!(contents, binary);
        assert_eq!(entry.unix_mode().map(|mode| mode & 0o777), Some(0o755));

        drop(entry);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn non_elf_binary_is_refused() {
        let dir = scratch_dir("elf");
        let path = dir.join("migrate_lambda.exe");
        fs::write(&path, b"MZ\x90\x00").expect("fixture should be written");

        let error = read_linux_binary(&path).expect_err("PE binary should be refused");

        assert!(error.contains("not a Linux ELF executable"));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn arch_maps_to_linux_target() {
        assert_eq!(LambdaArch::Arm64.target_triple(), "aarch64-unknown-linux-gnu");
        assert_eq!(LambdaArch::X86_64.artifact_suffix(), "x86_64");
    }
}
