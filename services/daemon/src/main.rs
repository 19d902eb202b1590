// tv-daemon: IPTV stream supervision daemon.
//
// Boot order matters: CLI verbs that address a *running* instance
// (`--stop`, `--reload`) act and exit before this process daemonizes,
// locks the pid file, or binds anything.

use clap::Parser;
use daemon::config::{self, DaemonConfig};
use daemon::pidfile::PidFile;
use daemon::supervisor::SHUTDOWN_TIMEOUT;
use daemon::{Daemon, client, license};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "tv-daemon", version, about = "IPTV stream supervision daemon")]
struct Args {
    /// Run in the background.
    #[arg(long)]
    daemon: bool,
    /// Stop the running instance and exit.
    #[arg(long)]
    stop: bool,
    /// Ask the running instance to reread its configuration.
    #[arg(long)]
    reload: bool,
    /// Config file path.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn load_config(path: &PathBuf) -> Result<DaemonConfig, ExitCode> {
    if path.exists() {
        config::load_config_from_path(path).map_err(|e| {
            eprintln!("FATAL: {e}");
            ExitCode::FAILURE
        })
    } else {
        eprintln!(
            "config file {} not found, using built-in defaults",
            path.display()
        );
        Ok(DaemonConfig::default())
    }
}

fn init_logging(cfg: &DaemonConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.clone()));

    match &cfg.log_path {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false)
                        .init();
                }
                Err(e) => {
                    eprintln!("cannot open log file {path}: {e}, logging to stderr");
                    tracing_subscriber::fmt()
                        .with_env_filter(
                            tracing_subscriber::EnvFilter::new(cfg.log_level.clone()),
                        )
                        .init();
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Classic double-fork detach; stdio ends up on /dev/null.
#[cfg(unix)]
fn daemonize() -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };

    if args.stop {
        return stop_running_instance(&cfg);
    }
    if args.reload {
        return reload_running_instance(&cfg);
    }

    if args.daemon {
        if let Err(e) = daemonize() {
            eprintln!("FATAL: cannot daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    init_logging(&cfg);

    let license_key = match license::fingerprint() {
        Ok(key) => key,
        Err(e) => {
            error!(error = %e, "license fingerprint failed");
            return ExitCode::FAILURE;
        }
    };

    let pid_path = PathBuf::from(&cfg.pid_file);
    let pid_lock = match PidFile::acquire(&pid_path, std::process::id()) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "cannot acquire pid file");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        daemonized = args.daemon,
        "tv-daemon starting"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot build runtime");
            pid_lock.release();
            return ExitCode::FAILURE;
        }
    };

    let users_file = cfg.users_file.clone();
    let result = runtime.block_on(run(cfg, license_key, users_file));

    pid_lock.release();
    match result {
        Ok(()) => {
            info!("tv-daemon exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "tv-daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    cfg: DaemonConfig,
    license_key: String,
    users_file: Option<String>,
) -> Result<(), daemon::DaemonError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut daemon = Daemon::start(cfg, license_key).await?;

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sighup = signal(SignalKind::hangup()).expect("SIGHUP handler");

    loop {
        tokio::select! {
            _ = daemon.wait_for_shutdown() => {
                // stop_service already drained the workers.
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, shutting down");
                daemon.supervisor.shutdown_workers(SHUTDOWN_TIMEOUT).await;
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT, shutting down");
                daemon.supervisor.shutdown_workers(SHUTDOWN_TIMEOUT).await;
                break;
            }
            _ = sighup.recv() => {
                reload_users(&daemon, users_file.as_deref()).await;
            }
        }
    }
    Ok(())
}

async fn reload_users(daemon: &Daemon, users_file: Option<&str>) {
    let Some(path) = users_file else {
        warn!("SIGHUP: no users_file configured, nothing to reload");
        return;
    };
    match daemon::users::load_directory(std::path::Path::new(path)) {
        Ok(directory) => {
            info!(users = directory.len(), "SIGHUP: user directory reloaded");
            daemon.hub.replace_directory(Box::new(directory)).await;
        }
        Err(e) => warn!(error = %e, "SIGHUP: user directory reload failed"),
    }
}

fn stop_running_instance(cfg: &DaemonConfig) -> ExitCode {
    let license_key = match license::fingerprint() {
        Ok(key) => key,
        Err(e) => {
            eprintln!("FATAL: {e}");
            return ExitCode::FAILURE;
        }
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    match runtime.block_on(client::send_stop_service(&cfg.control_bind, &license_key)) {
        Ok(()) => {
            println!("stop acknowledged");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("stop failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn reload_running_instance(cfg: &DaemonConfig) -> ExitCode {
    let pid = match PidFile::read_pid(std::path::Path::new(&cfg.pid_file)) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("reload failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
    if rc != 0 {
        eprintln!(
            "reload failed: cannot signal pid {pid}: {}",
            std::io::Error::last_os_error()
        );
        return ExitCode::FAILURE;
    }
    println!("reload signalled to pid {pid}");
    ExitCode::SUCCESS
}
