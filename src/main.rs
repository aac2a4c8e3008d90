use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dicom_anonymizer::config::ProjectModel;
use dicom_anonymizer::error::AnonymizerError;
use dicom_anonymizer::service::ProjectService;

/// Headless DICOM de-identification service.
#[derive(Parser)]
#[command(name = "dicom-anonymizer")]
#[command(about = "DICOM de-identification service", long_about = None)]
struct Cli {
    /// Path to the project configuration (ProjectModel.json)
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

// Exit codes: 0 clean shutdown, 2 config error, 3 bind failure, 4 storage
// error.
const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;
const EXIT_STORAGE: u8 = 4;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let model = match ProjectModel::load(&cli.config) {
        Ok(model) => model,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(model.logging_levels.filter_directives())),
        )
        .init();

    let service = match ProjectService::open(model) {
        Ok(service) => service,
        Err(e) => {
            error!("cannot open project: {e}");
            let code = match &e {
                AnonymizerError::Config(msg) if msg.contains("cannot bind") => EXIT_BIND,
                AnonymizerError::Config(_) | AnonymizerError::Script(_) => EXIT_CONFIG,
                AnonymizerError::ModelVersionMismatch { .. } => EXIT_STORAGE,
                _ => EXIT_STORAGE,
            };
            return ExitCode::from(code);
        }
    };

    info!("service running, Ctrl-C to stop");
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::Release)) {
            error!("cannot install signal handler: {e}");
        }
    }
    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
    }

    service.shutdown();
    info!("clean shutdown");
    ExitCode::SUCCESS
}
