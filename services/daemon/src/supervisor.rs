//! Stream supervision: the worker registry, the upstream control endpoint,
//! and the restart policy.
//!
//! One task per worker monitors the child process and its control
//! connection; the supervisor itself is shared state those tasks and the
//! control-connection tasks operate through.  Everything runs on one
//! cooperative loop -- parallelism lives in the worker processes.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use tv_core::stats::StatsRegion;
use tv_core::{
    CONFIG_FILE_NAME, CONTROL_SOCKET_NAME, LOGS_FILE_NAME, StreamConfig, StreamId, StreamStatus,
    now_ms, procstat::ProcSampler,
};
use tv_proto::commands::{
    ActivateInfo, QuitStatusInfo, ServerPingInfo, ServiceInfo, ServiceStatisticInfo,
    StartStreamInfo, StateServiceInfo, StatisticInfo, StreamIdInfo, StreamLogInfo, StreamSummary,
    SyncInfo, pack, quit_status_stream_broadcast, statistic_service_broadcast,
    statistic_stream_broadcast, unpack,
};
use tv_proto::{ErrorKind, Message, Request, Response, RpcCodec, RpcError, methods};

use crate::config::DaemonConfig;
use crate::pending::{PendingScope, PendingTable, WORKER_TIMEOUT};

/// Default respawn budget for abnormal exits.
pub const DEFAULT_RESTART_ATTEMPTS: u32 = 3;
/// Hard-kill delay after `stop_stream`.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(30);
/// Orderly-shutdown grace before surviving workers are killed.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a freshly spawned worker gets to dial the control socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Cap on exponential restart backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// How much of a worker log `get_log_stream` returns.
const LOG_TAIL_BYTES: u64 = 64 * 1024;

#[derive(Debug)]
enum WorkerCommand {
    Send(Request),
    Kill,
}

struct WorkerEntry {
    config: StreamConfig,
    status: StreamStatus,
    restarts_left: u32,
    attempt: u32,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    region: StatsRegion,
    last_stats: Option<StatisticInfo>,
    started_ms: i64,
    terminating: bool,
}

struct SpawnedWorker {
    child: Child,
    listener: UnixListener,
}

struct SupervisorInner {
    cfg: DaemonConfig,
    license: String,
    activated: AtomicBool,
    seq: AtomicU64,
    pending: PendingTable,
    workers: RwLock<HashMap<StreamId, WorkerEntry>>,
    upstream: RwLock<Option<mpsc::Sender<Message>>>,
    subscribers_online: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        cfg: DaemonConfig,
        license: String,
        subscribers_online: Arc<AtomicU64>,
    ) -> (Supervisor, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sup = Supervisor {
            inner: Arc::new(SupervisorInner {
                cfg,
                license,
                activated: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                pending: PendingTable::new(),
                workers: RwLock::new(HashMap::new()),
                upstream: RwLock::new(None),
                subscribers_online,
                shutdown,
            }),
        };
        (sup, shutdown_rx)
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    fn next_seq(&self) -> String {
        self.inner.seq.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_upstream(&self, msg: Message) {
        let tx = self.inner.upstream.read().await.clone();
        match tx {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    debug!("upstream writer gone, notification dropped");
                }
            }
            None => debug!("no upstream connection, notification dropped"),
        }
    }

    // -----------------------------------------------------------------------
    // Control endpoint
    // -----------------------------------------------------------------------

    /// Accept loop for the upstream control endpoint.
    pub async fn run_control_listener(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "control connection accepted");
                    tokio::spawn(self.clone().handle_control_conn(stream));
                }
                Err(e) => {
                    warn!(error = %e, "control accept error");
                }
            }
        }
    }

    async fn handle_control_conn(self, stream: TcpStream) {
        let framed = Framed::new(stream, RpcCodec::new());
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        // The newest control connection is the upstream; a reconnecting
        // orchestrator simply displaces its dead predecessor.
        *self.inner.upstream.write().await = Some(tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Request(req)) => {
                    let sup = self.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(resp) = sup.dispatch_service(req).await {
                            let _ = tx.send(Message::Response(resp)).await;
                        }
                    });
                }
                Ok(Message::Response(resp)) => {
                    self.inner.pending.complete(&resp.id, resp.result);
                }
                Err(e) => {
                    warn!(error = %e, "control connection protocol error, closing");
                    break;
                }
            }
        }

        self.inner.pending.cancel_scope(&PendingScope::Upstream);
        {
            let mut upstream = self.inner.upstream.write().await;
            if upstream.as_ref().is_some_and(|u| u.same_channel(&tx)) {
                *upstream = None;
            }
        }
        writer.abort();
        info!("control connection closed");
    }

    async fn dispatch_service(&self, req: Request) -> Option<Response> {
        let seq = match req.id.clone() {
            Some(seq) => seq,
            None => {
                warn!(method = %req.method, "ignoring inbound notification");
                return None;
            }
        };
        let result = self.handle_service_method(&req).await;
        if let Err(e) = &result {
            debug!(method = %req.method, code = ?e.code, "request failed: {}", e.message);
        }
        Some(Response { id: seq, result })
    }

    async fn handle_service_method(&self, req: &Request) -> Result<String, RpcError> {
        let params = req.params.as_deref();
        match req.method.as_str() {
            methods::ACTIVATE | methods::PREPARE_SERVICE => {
                let info: ActivateInfo = unpack(params)?;
                if info.license != self.inner.license {
                    return Err(RpcError::new(ErrorKind::Unauthorized, "license mismatch"));
                }
                self.inner.activated.store(true, Ordering::Relaxed);
                info!("service activated");
                Ok(pack(&ServiceInfo {
                    version: env!("CARGO_PKG_VERSION").to_owned(),
                    fingerprint: self.inner.license.clone(),
                }))
            }
            methods::PING_SERVICE => Ok(pack(&ServerPingInfo {
                timestamp: now_ms(),
            })),
            methods::STOP_SERVICE => {
                // Authenticated by license so `--stop` works without a prior
                // activate on this connection.
                let info: ActivateInfo = unpack(params)?;
                if info.license != self.inner.license {
                    return Err(RpcError::new(ErrorKind::Unauthorized, "license mismatch"));
                }
                info!("stop_service accepted, shutting down");
                let sup = self.clone();
                tokio::spawn(async move {
                    sup.shutdown_workers(SHUTDOWN_TIMEOUT).await;
                    let _ = sup.inner.shutdown.send(true);
                });
                Ok(String::new())
            }
            _ if !self.inner.activated.load(Ordering::Relaxed) => Err(RpcError::new(
                ErrorKind::Unauthorized,
                "service is not activated",
            )),
            methods::START_STREAM => {
                let info: StartStreamInfo = unpack(params)?;
                self.start_stream(info.config).await?;
                Ok(String::new())
            }
            methods::STOP_STREAM => {
                let info: StreamIdInfo = unpack(params)?;
                self.stop_stream(&info.id).await
            }
            methods::RESTART_STREAM => {
                let info: StreamIdInfo = unpack(params)?;
                self.restart_stream(&info.id).await
            }
            methods::SYNC_SERVICE => {
                let info: SyncInfo = unpack(params)?;
                self.sync_streams(info.streams).await;
                Ok(String::new())
            }
            methods::STATE_SERVICE => Ok(pack(&self.state_snapshot().await)),
            methods::GET_LOG_STREAM => {
                let info: StreamIdInfo = unpack(params)?;
                self.stream_log(&info.id).await
            }
            other => Err(RpcError::new(
                ErrorKind::NotFound,
                format!("unknown method '{other}'"),
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Stream operations
    // -----------------------------------------------------------------------

    /// Register a worker entry and spawn its first child.  A spawn failure
    /// is surfaced to the caller and leaves no entry behind.
    pub async fn start_stream(&self, mut config: StreamConfig) -> Result<(), RpcError> {
        // The daemon owns feedback-dir placement.
        let id = config.id().clone();
        let feedback_dir = PathBuf::from(&self.inner.cfg.feedback_dir).join(&id);
        config.base_mut().feedback_dir = feedback_dir.display().to_string();

        config
            .validate()
            .map_err(|e| RpcError::new(ErrorKind::InvalidConfig, e.to_string()))?;

        let restarts_left = config
            .base()
            .restart_attempts
            .unwrap_or(DEFAULT_RESTART_ATTEMPTS);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        {
            let mut workers = self.inner.workers.write().await;
            if workers.contains_key(&id) {
                return Err(RpcError::new(
                    ErrorKind::AlreadyExists,
                    format!("stream '{id}' is already registered"),
                ));
            }
            workers.insert(
                id.clone(),
                WorkerEntry {
                    config: config.clone(),
                    status: StreamStatus::New,
                    restarts_left,
                    attempt: 0,
                    cmd_tx,
                    region: StatsRegion::new(&feedback_dir),
                    last_stats: None,
                    started_ms: now_ms(),
                    terminating: false,
                },
            );
        }

        match self.spawn_child(&id).await {
            Ok(spawned) => {
                info!(stream_id = %id, "worker spawned");
                tokio::spawn(self.clone().monitor_worker(id, spawned, cmd_rx));
                Ok(())
            }
            Err(e) => {
                self.remove_worker(&id).await;
                Err(e)
            }
        }
    }

    pub async fn stop_stream(&self, id: &str) -> Result<String, RpcError> {
        let cmd_tx = {
            let mut workers = self.inner.workers.write().await;
            let entry = workers
                .get_mut(id)
                .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("no stream '{id}'")))?;
            entry.terminating = true;
            entry.cmd_tx.clone()
        };

        // Hard-kill the child if it ignores the stop request.
        let sup = self.clone();
        let kill_id = id.to_owned();
        let kill_tx = cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_TIMEOUT).await;
            if sup.inner.workers.read().await.contains_key(&kill_id) {
                warn!(stream_id = %kill_id, "worker ignored stop, killing");
                let _ = kill_tx.send(WorkerCommand::Kill).await;
            }
        });

        self.send_worker_request(id, cmd_tx, methods::STOP).await
    }

    pub async fn restart_stream(&self, id: &str) -> Result<String, RpcError> {
        let cmd_tx = {
            let workers = self.inner.workers.read().await;
            let entry = workers
                .get(id)
                .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("no stream '{id}'")))?;
            entry.cmd_tx.clone()
        };
        self.send_worker_request(id, cmd_tx, methods::RESTART).await
    }

    async fn send_worker_request(
        &self,
        id: &str,
        cmd_tx: mpsc::Sender<WorkerCommand>,
        method: &str,
    ) -> Result<String, RpcError> {
        let seq = self.next_seq();
        let rx = self.inner.pending.register(
            seq.clone(),
            PendingScope::Worker(id.to_owned()),
            WORKER_TIMEOUT,
        );
        let req = Request::new(seq, method, None);
        if cmd_tx.send(WorkerCommand::Send(req)).await.is_err() {
            return Err(RpcError::new(ErrorKind::PeerGone, "worker is gone"));
        }
        rx.await
            .unwrap_or_else(|_| Err(RpcError::new(ErrorKind::Internal, "continuation dropped")))
    }

    async fn sync_streams(&self, streams: Vec<StreamConfig>) {
        for config in streams {
            let id = config.id().clone();
            let running = self.inner.workers.read().await.contains_key(&id);
            if running {
                continue;
            }
            if let Err(e) = self.start_stream(config).await {
                warn!(stream_id = %id, error = %e, "sync: failed to start stream");
            }
        }
    }

    async fn state_snapshot(&self) -> StateServiceInfo {
        let now = now_ms();
        let workers = self.inner.workers.read().await;
        let mut streams: Vec<StreamSummary> = workers
            .iter()
            .map(|(id, entry)| {
                let (bps_input, bps_output) = entry
                    .last_stats
                    .as_ref()
                    .map(|s| (s.bps_input.clone(), s.bps_output.clone()))
                    .unwrap_or_default();
                StreamSummary {
                    id: id.clone(),
                    status: entry.status,
                    uptime_secs: (now.saturating_sub(entry.started_ms) / 1000).max(0) as u64,
                    restarts_left: entry.restarts_left,
                    bps_input,
                    bps_output,
                }
            })
            .collect();
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        StateServiceInfo { streams }
    }

    async fn stream_log(&self, id: &str) -> Result<String, RpcError> {
        let exists = self.inner.workers.read().await.contains_key(id);
        if !exists {
            return Err(RpcError::new(ErrorKind::NotFound, format!("no stream '{id}'")));
        }
        let path = PathBuf::from(&self.inner.cfg.feedback_dir)
            .join(id)
            .join(LOGS_FILE_NAME);
        let content = read_tail(&path, LOG_TAIL_BYTES)
            .map_err(|e| RpcError::new(ErrorKind::Io, e.to_string()))?;
        Ok(pack(&StreamLogInfo {
            id: id.to_owned(),
            content,
        }))
    }

    // -----------------------------------------------------------------------
    // Child lifecycle
    // -----------------------------------------------------------------------

    fn worker_binary(&self) -> Result<PathBuf, RpcError> {
        if let Some(path) = &self.inner.cfg.worker_binary {
            return Ok(PathBuf::from(path));
        }
        let exe = std::env::current_exe()
            .map_err(|e| RpcError::new(ErrorKind::Internal, e.to_string()))?;
        Ok(exe.with_file_name("stream-worker"))
    }

    async fn spawn_child(&self, id: &str) -> Result<SpawnedWorker, RpcError> {
        let (config, restarts_left) = {
            let workers = self.inner.workers.read().await;
            let entry = workers
                .get(id)
                .ok_or_else(|| RpcError::new(ErrorKind::NotFound, format!("no stream '{id}'")))?;
            (entry.config.clone(), entry.restarts_left)
        };

        let feedback_dir = PathBuf::from(&config.base().feedback_dir);
        let io_err = |e: std::io::Error| RpcError::new(ErrorKind::Io, e.to_string());
        std::fs::create_dir_all(&feedback_dir).map_err(io_err)?;

        let config_path = feedback_dir.join(CONFIG_FILE_NAME);
        let config_json = serde_json::to_vec_pretty(&config)
            .map_err(|e| RpcError::new(ErrorKind::Internal, e.to_string()))?;
        std::fs::write(&config_path, config_json).map_err(io_err)?;

        let socket_path = feedback_dir.join(CONTROL_SOCKET_NAME);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(io_err)?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(io_err)?;

        let child = Command::new(self.worker_binary()?)
            .arg("--id")
            .arg(id)
            .arg("--config")
            .arg(&config_path)
            .arg("--feedback-dir")
            .arg(&feedback_dir)
            .arg("--control")
            .arg(&socket_path)
            .arg("--restarts-left")
            .arg(restarts_left.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RpcError::new(ErrorKind::Internal, format!("spawning worker: {e}"))
            })?;

        Ok(SpawnedWorker { child, listener })
    }

    /// Owns one worker slot for its whole life, across respawns.
    async fn monitor_worker(
        self,
        id: StreamId,
        mut spawned: SpawnedWorker,
        mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    ) {
        loop {
            let status = self
                .run_worker_session(&id, &mut spawned, &mut cmd_rx)
                .await;

            let (exit_code, signal) = match status {
                Ok(status) => (
                    status.code().unwrap_or(0),
                    status.signal().unwrap_or(0),
                ),
                Err(e) => {
                    error!(stream_id = %id, error = %e, "waiting for worker failed");
                    (1, 0)
                }
            };
            self.on_worker_exit(&id, exit_code, signal).await;

            match self.restart_decision(&id, exit_code, signal).await {
                Some(backoff) => {
                    info!(
                        stream_id = %id,
                        backoff_secs = backoff.as_secs(),
                        "respawning worker after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    match self.spawn_child(&id).await {
                        Ok(next) => {
                            {
                                let mut workers = self.inner.workers.write().await;
                                if let Some(entry) = workers.get_mut(&id) {
                                    entry.started_ms = now_ms();
                                    entry.status = StreamStatus::New;
                                }
                            }
                            spawned = next;
                        }
                        Err(e) => {
                            error!(stream_id = %id, error = %e, "respawn failed, giving up");
                            self.remove_worker(&id).await;
                            return;
                        }
                    }
                }
                None => {
                    self.remove_worker(&id).await;
                    return;
                }
            }
        }
    }

    /// Drive one child until it exits; handles its control traffic.
    async fn run_worker_session(
        &self,
        id: &str,
        spawned: &mut SpawnedWorker,
        cmd_rx: &mut mpsc::Receiver<WorkerCommand>,
    ) -> std::io::Result<std::process::ExitStatus> {
        let accepted =
            tokio::time::timeout(CONNECT_TIMEOUT, spawned.listener.accept()).await;
        let mut control = match accepted {
            Ok(Ok((stream, _))) => Some(Framed::new(stream, RpcCodec::new())),
            Ok(Err(e)) => {
                warn!(stream_id = %id, error = %e, "worker control accept failed, killing");
                let _ = spawned.child.start_kill();
                None
            }
            Err(_) => {
                warn!(stream_id = %id, "worker never dialed control socket, killing");
                let _ = spawned.child.start_kill();
                None
            }
        };

        loop {
            if let Some(framed) = control.as_mut() {
                let mut lost_control = false;
                tokio::select! {
                    status = spawned.child.wait() => return status,
                    frame = framed.next() => match frame {
                        None | Some(Err(_)) => {
                            // Control is gone; the exit status tells the
                            // rest of the story.
                            lost_control = true;
                        }
                        Some(Ok(Message::Request(req))) => {
                            self.on_worker_broadcast(id, req).await;
                        }
                        Some(Ok(Message::Response(resp))) => {
                            self.inner.pending.complete(&resp.id, resp.result);
                        }
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(WorkerCommand::Send(req)) => {
                            if framed.send(Message::Request(req)).await.is_err() {
                                warn!(stream_id = %id, "worker control write failed");
                            }
                        }
                        Some(WorkerCommand::Kill) => {
                            let _ = spawned.child.start_kill();
                        }
                        None => {}
                    },
                }
                if lost_control {
                    control = None;
                }
            } else {
                tokio::select! {
                    status = spawned.child.wait() => return status,
                    cmd = cmd_rx.recv() => {
                        if let Some(WorkerCommand::Kill) = cmd {
                            let _ = spawned.child.start_kill();
                        }
                    }
                }
            }
        }
    }

    async fn on_worker_broadcast(&self, id: &str, req: Request) {
        match req.method.as_str() {
            methods::STATISTIC_STREAM => {
                match unpack::<StatisticInfo>(req.params.as_deref()) {
                    Ok(info) => {
                        {
                            let mut workers = self.inner.workers.write().await;
                            if let Some(entry) = workers.get_mut(id) {
                                entry.status = info.status;
                                entry.last_stats = Some(info.clone());
                            }
                        }
                        self.send_upstream(Message::Request(statistic_stream_broadcast(&info)))
                            .await;
                    }
                    Err(e) => warn!(stream_id = %id, error = %e, "bad statistic_stream"),
                }
            }
            methods::CHANGED_SOURCE_STREAM => {
                // Re-broadcast under the service-facing (plural) name.
                let upstream = Request::notification(
                    methods::CHANGED_SOURCES_STREAM,
                    req.params.clone(),
                );
                self.send_upstream(Message::Request(upstream)).await;
            }
            other => {
                warn!(stream_id = %id, method = other, "unexpected worker message");
            }
        }
    }

    /// Final stats drain + `quit_status_stream`, once per reap.
    async fn on_worker_exit(&self, id: &str, exit_code: i32, signal: i32) {
        info!(stream_id = %id, exit_code, signal, "worker exited");

        let region = {
            let workers = self.inner.workers.read().await;
            workers.get(id).map(|e| e.region.clone())
        };
        if let Some(region) = region {
            match region.sample() {
                Ok(Some(record)) => {
                    let info = StatisticInfo {
                        id: record.id.clone(),
                        status: record.status,
                        cpu_load: record.cpu_load,
                        rss_bytes: record.rss_bytes,
                        timestamp: now_ms(),
                        restarts_left: record.restarts_left,
                        bps_input: record.input.iter().map(|c| c.bps()).collect(),
                        bps_output: record.output.iter().map(|c| c.bps()).collect(),
                        total_bytes_input: record.input.iter().map(|c| c.total_bytes()).collect(),
                        total_bytes_output: record
                            .output
                            .iter()
                            .map(|c| c.total_bytes())
                            .collect(),
                    };
                    self.send_upstream(Message::Request(statistic_stream_broadcast(&info)))
                        .await;
                }
                Ok(None) => {}
                Err(e) => warn!(stream_id = %id, error = %e, "final stats sample failed"),
            }
            if let Err(e) = region.remove() {
                warn!(stream_id = %id, error = %e, "removing stats region failed");
            }
        }

        self.inner
            .pending
            .cancel_scope(&PendingScope::Worker(id.to_owned()));

        let quit = QuitStatusInfo {
            id: id.to_owned(),
            exit_status: exit_code,
            signal,
        };
        self.send_upstream(Message::Request(quit_status_stream_broadcast(&quit)))
            .await;
    }

    /// `Some(backoff)` to respawn, `None` to retire the stream.
    async fn restart_decision(
        &self,
        id: &str,
        exit_code: i32,
        signal: i32,
    ) -> Option<Duration> {
        let abnormal = exit_code != 0 || signal != 0;
        let mut workers = self.inner.workers.write().await;
        let entry = workers.get_mut(id)?;
        if entry.terminating || !abnormal {
            return None;
        }
        if entry.restarts_left == 0 {
            warn!(stream_id = %id, "restart budget exhausted, stream terminated");
            return None;
        }
        entry.restarts_left -= 1;
        entry.attempt += 1;
        Some(backoff_for_attempt(entry.attempt))
    }

    async fn remove_worker(&self, id: &str) {
        self.inner.workers.write().await.remove(id);
        debug!(stream_id = %id, "worker entry removed");
    }

    /// Orderly shutdown: stop every worker, kill survivors after `grace`.
    pub async fn shutdown_workers(&self, grace: Duration) {
        let targets: Vec<(StreamId, mpsc::Sender<WorkerCommand>)> = {
            let mut workers = self.inner.workers.write().await;
            workers
                .iter_mut()
                .map(|(id, entry)| {
                    entry.terminating = true;
                    (id.clone(), entry.cmd_tx.clone())
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        info!(count = targets.len(), "stopping all workers");

        for (id, cmd_tx) in &targets {
            let seq = self.next_seq();
            let _rx = self.inner.pending.register(
                seq.clone(),
                PendingScope::Worker(id.clone()),
                WORKER_TIMEOUT,
            );
            let req = Request::new(seq, methods::STOP, None);
            let _ = cmd_tx.send(WorkerCommand::Send(req)).await;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.inner.workers.read().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        warn!("shutdown grace elapsed, killing surviving workers");
        for (_, cmd_tx) in &targets {
            let _ = cmd_tx.send(WorkerCommand::Kill).await;
        }
        let hard_deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < hard_deadline {
            if self.inner.workers.read().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Periodic tasks
    // -----------------------------------------------------------------------

    /// Broadcast aggregate `statistic_service` on the configured cadence.
    pub async fn run_statistic_reporter(self) {
        let mut sampler = ProcSampler::new();
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.inner.cfg.stats_interval_secs,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            let now = now_ms();
            let sample = sampler.sample(now);
            let (streams_running, bps_in, bps_out) = {
                let workers = self.inner.workers.read().await;
                let mut bps_in = 0u64;
                let mut bps_out = 0u64;
                for entry in workers.values() {
                    if let Some(stats) = &entry.last_stats {
                        bps_in += stats.bps_input.iter().sum::<u64>();
                        bps_out += stats.bps_output.iter().sum::<u64>();
                    }
                }
                (workers.len() as u64, bps_in, bps_out)
            };
            let info = ServiceStatisticInfo {
                timestamp: now,
                cpu_load: sample.cpu_load,
                rss_bytes: sample.rss_bytes,
                streams_running,
                subscribers_online: self.inner.subscribers_online.load(Ordering::Relaxed),
                total_bps_input: bps_in,
                total_bps_output: bps_out,
            };
            self.send_upstream(Message::Request(statistic_service_broadcast(&info)))
                .await;
        }
    }

    /// Sweep the pending table for overdue continuations.
    pub async fn run_pending_sweeper(self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            self.inner.pending.expire_due(Instant::now());
        }
    }
}

/// `min(2^attempt, 60)` seconds.
fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(6)).min(MAX_BACKOFF)
}

fn read_tail(path: &std::path::Path, max_bytes: u64) -> std::io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps_at_a_minute() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(32));
        assert_eq!(backoff_for_attempt(6), Duration::from_secs(60));
        assert_eq!(backoff_for_attempt(30), Duration::from_secs(60));
    }

    #[test]
    fn read_tail_returns_the_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.log");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_tail(&path, 100).unwrap(), "0123456789");
        assert_eq!(read_tail(&path, 4).unwrap(), "6789");
    }
}
