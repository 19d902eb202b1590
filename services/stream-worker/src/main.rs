// stream-worker: hosts exactly one pipeline on behalf of the daemon.
//
// Never started by hand -- the daemon prepares the feedback directory,
// writes the config file, binds the control socket, and passes all three
// here.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tv_core::{DUMP_FILE_NAME, LOGS_FILE_NAME, StreamConfig};

#[derive(Parser)]
#[command(name = "stream-worker", version, about = "tv-daemon stream worker")]
struct Args {
    /// Stream id; must match the config's id.
    #[arg(long)]
    id: String,
    /// Path to the stream config (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Per-stream working directory.
    #[arg(long)]
    feedback_dir: PathBuf,
    /// Control socket the supervisor is listening on.
    #[arg(long)]
    control: PathBuf,
    /// Mirror of the supervisor's restart budget, for metrics only.
    #[arg(long, default_value_t = 3)]
    restarts_left: u32,
}

fn init_logging(feedback_dir: &std::path::Path, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_owned()));

    let log_path = feedback_dir.join(LOGS_FILE_NAME);
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Leave a crash report in the feedback directory before dying.
fn install_dump_hook(feedback_dir: &Path) {
    let dump_path = feedback_dir.join(DUMP_FILE_NAME);
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let body = format!(
            "<html><body><h1>stream-worker crash</h1><pre>{info}\n\n{}</pre></body></html>",
            std::backtrace::Backtrace::force_capture()
        );
        let _ = std::fs::write(&dump_path, body);
        default_hook(info);
    }));
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config_bytes = match std::fs::read(&args.config) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("FATAL: reading config {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let config: StreamConfig = match serde_json::from_slice(&config_bytes) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: parsing config {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&args.feedback_dir, &config.base().log_level);
    install_dump_hook(&args.feedback_dir);

    if *config.id() != args.id {
        error!(arg = %args.id, config = %config.id(), "stream id mismatch");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stream_id = %args.id,
        "stream worker starting"
    );

    let result = stream_worker::run_worker(stream_worker::WorkerArgs {
        config,
        feedback_dir: args.feedback_dir,
        control_socket: args.control,
        restarts_left: args.restarts_left,
    })
    .await;

    match result {
        Ok(code) => {
            info!(stream_id = %args.id, code, "stream worker exiting");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!(stream_id = %args.id, error = %e, "stream worker failed");
            ExitCode::FAILURE
        }
    }
}
