use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;

use index_release::app::ReleaseApp;
use index_release::config::Settings;
use index_release::observability::ObservabilityGuard;

#[derive(Parser, Debug)]
#[command(name = "index-release")]
#[command(about = "Atomic, signature-verified releases of a searchable content index", long_about = None)]
struct Cli {
    /// Base directory holding releases/, current and rollback (overrides INDEX_RELEASE_BASE_DIR).
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify, stage and atomically promote a signed release.
    Update {
        manifest: PathBuf,
        signature: PathBuf,
        public_key: PathBuf,
        /// Directory holding the release files (defaults to the manifest's directory).
        #[arg(long)]
        source_dir: Option<PathBuf>,
    },
    /// Show pointers, releases, version metadata and lock holder as JSON.
    Status,
    /// Validate configuration.
    Doctor {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report whether an update currently holds the base directory lock.
    LockStatus,
    /// Verify the hash chain of the update audit journal.
    AuditVerify,
    /// Apply the retention window outside of an update.
    Prune {
        /// Override INDEX_RELEASE_RETENTION_KEEP for this run.
        #[arg(long, value_parser = parse_positive_usize)]
        keep: Option<usize>,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(base_dir) = cli.base_dir {
        settings.base_dir = base_dir;
    }
    let _observability = ObservabilityGuard::init(settings.otel_enabled);

    match cli.command.unwrap_or(Commands::Doctor { json: false }) {
        Commands::Update {
            manifest,
            signature,
            public_key,
            source_dir,
        } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let signal_flag = Arc::clone(&cancel);
            ctrlc::set_handler(move || {
                signal_flag.store(true, Ordering::SeqCst);
                warn!("interrupt received; aborting before the swap if still possible");
            })?;

            let app = ReleaseApp::new(settings)?.with_cancel_flag(cancel);
            let (code, report) =
                app.update_json(&manifest, &signature, &public_key, source_dir.as_deref())?;
            println!("{}", report);
            Ok(exit_code(code))
        }
        Commands::Status => {
            let app = ReleaseApp::new(settings)?;
            println!("{}", app.status_json()?);
            Ok(0)
        }
        Commands::Doctor { json } => {
            let app = ReleaseApp::new(settings)?;
            if json {
                println!("{}", app.doctor_json()?);
                return Ok(0);
            }

            let report = app.doctor();
            println!("index-release doctor");
            println!("base_dir: {}", report.base_dir);
            println!("base_dir_exists: {}", report.base_dir_exists);
            println!("retention_keep: {}", report.retention_keep);
            println!("required_artifacts: {}", report.required_artifacts.join(","));
            println!("smoke_check: {}", report.smoke_check);
            if let Some(command) = report.smoke_check_command.as_deref() {
                println!(
                    "smoke_check_command: {} {}",
                    command,
                    report.smoke_check_args.join(" ")
                );
                println!("smoke_check_timeout_secs: {}", report.smoke_check_timeout_secs);
            }
            println!("hash_workers: {}", report.hash_workers);
            println!("audit_enabled: {}", report.audit_enabled);
            println!("otel_enabled: {}", report.otel_enabled);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
            Ok(0)
        }
        Commands::LockStatus => {
            let app = ReleaseApp::new(settings)?;
            println!("{}", app.lock_status_json()?);
            Ok(0)
        }
        Commands::AuditVerify => {
            let app = ReleaseApp::new(settings)?;
            let (code, report) = app.audit_verify_json()?;
            println!("{}", report);
            Ok(exit_code(code))
        }
        Commands::Prune { keep } => {
            let app = ReleaseApp::new(settings)?;
            let (code, report) = app.prune_json(keep)?;
            println!("{}", report);
            Ok(exit_code(code))
        }
    }
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn parse_positive_usize(value: &str) -> std::result::Result<usize, String> {
    let parsed = value
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid positive integer: {value}"))?;
    if parsed == 0 {
        return Err("value must be >= 1".to_string());
    }
    Ok(parsed)
}
