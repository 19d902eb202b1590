//! Worker control loop.
//!
//! Owns the stream's metrics record and its pipeline, speaks the framed
//! control protocol with the supervisor, and drives the status machine
//! `New -> Init -> (Playing <-> Frozen)` with `Waiting` while buffering.
//!
//! Contract with the supervisor:
//! - the stats snapshot is republished at least once per interval tick;
//! - `statistic_stream` is broadcast on the same cadence;
//! - `changed_source_stream` is broadcast on every source-set change;
//! - `restart` rebuilds the pipeline in-process; `stop` exits with 0;
//! - an unrecoverable pipeline error exits non-zero.

use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use tv_core::procstat::ProcSampler;
use tv_core::stats::{StatsRegion, StreamStruct};
use tv_core::{ChannelId, StreamConfig, StreamId, StreamStatus, now_ms};
use tv_proto::codec::CodecError;
use tv_proto::commands::{
    ChangedSourcesInfo, StatisticInfo, changed_source_stream_broadcast, statistic_stream_broadcast,
};
use tv_proto::{ErrorKind, Message, Request, Response, methods};

use crate::factory::{FactoryError, PipelineSpec, build_spec};
use crate::media::{MediaBackend, MediaError, PipelineEvent, PipelineHandle, Side};
use crate::probes::SourceProbe;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("control: {0}")]
    Control(#[from] CodecError),
    #[error("stats: {0}")]
    Stats(#[from] tv_core::stats::StatsError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipeline failed: {0}")]
    Pipeline(String),
}

type Control = Framed<UnixStream, tv_proto::RpcCodec>;

pub struct Controller<B> {
    id: StreamId,
    spec: PipelineSpec,
    backend: B,
    region: StatsRegion,
    record: StreamStruct,
    probes: Vec<SourceProbe>,
    input_channels: Vec<ChannelId>,
    output_channels: Vec<ChannelId>,
    sampler: ProcSampler,
    stats_interval_secs: u64,
}

impl<B: MediaBackend> Controller<B> {
    pub fn new(
        config: StreamConfig,
        feedback_dir: &Path,
        backend: B,
        restarts_left: u32,
    ) -> Result<Self, WorkerError> {
        let spec = build_spec(&config)?;
        let base = spec.config.base();
        let input_channels: Vec<ChannelId> = base.input.iter().map(|i| i.id).collect();
        let output_channels: Vec<ChannelId> = base.output.iter().map(|o| o.id).collect();
        let record = StreamStruct::new(
            base.id.clone(),
            spec.config.stream_type(),
            &input_channels,
            &output_channels,
            restarts_left,
            now_ms(),
        );
        let probes = input_channels
            .iter()
            .map(|c| SourceProbe::new(format!("input{c}")))
            .collect();

        Ok(Controller {
            id: base.id.clone(),
            stats_interval_secs: base.stats_interval_secs.max(1),
            backend,
            region: StatsRegion::new(feedback_dir),
            record,
            probes,
            input_channels,
            output_channels,
            sampler: ProcSampler::new(),
            spec,
        })
    }

    /// Run until stopped.  Returns the process exit code.
    pub async fn run(mut self, control: UnixStream) -> Result<i32, WorkerError> {
        let mut control = Framed::new(control, tv_proto::RpcCodec::new());
        let mut pipeline = self.backend.build(&self.spec)?;
        self.set_status(StreamStatus::Init);
        self.region.publish(&self.record)?;

        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(self.stats_interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // the immediate first tick carries no window

        loop {
            tokio::select! {
                frame = control.next() => match frame {
                    None => {
                        info!(stream_id = %self.id, "control connection closed, stopping");
                        pipeline.shutdown();
                        self.region.publish(&self.record)?;
                        return Ok(0);
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Request(req))) => {
                        if let Some(exit) =
                            self.handle_request(req, &mut control, &mut pipeline).await?
                        {
                            return Ok(exit);
                        }
                    }
                    Some(Ok(Message::Response(resp))) => {
                        // Broadcasts carry no id, so nothing we sent expects
                        // a reply.
                        debug!(stream_id = %self.id, seq = %resp.id, "unexpected response");
                    }
                },
                event = pipeline.events.recv() => match event {
                    None => {
                        info!(stream_id = %self.id, "pipeline ended");
                        self.region.publish(&self.record)?;
                        return Ok(0);
                    }
                    Some(PipelineEvent::Fatal(reason)) => {
                        self.region.publish(&self.record)?;
                        return Err(WorkerError::Pipeline(reason));
                    }
                    Some(PipelineEvent::Eos) => {
                        info!(stream_id = %self.id, "end of stream");
                        pipeline.shutdown();
                        self.region.publish(&self.record)?;
                        return Ok(0);
                    }
                    Some(event) => self.apply_event(event, &mut control).await?,
                },
                _ = tick.tick() => {
                    self.on_stats_tick(&mut control).await?;
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        req: Request,
        control: &mut Control,
        pipeline: &mut PipelineHandle,
    ) -> Result<Option<i32>, WorkerError> {
        match req.method.as_str() {
            methods::STOP => {
                info!(stream_id = %self.id, "stop requested");
                pipeline.shutdown();
                self.region.publish(&self.record)?;
                if let Some(id) = req.id {
                    control.send(Message::Response(Response::ok(id, ""))).await?;
                }
                Ok(Some(0))
            }
            methods::RESTART => {
                info!(stream_id = %self.id, "restart requested, rebuilding pipeline");
                pipeline.shutdown();
                *pipeline = self.backend.build(&self.spec)?;
                self.set_status(StreamStatus::New);
                self.set_status(StreamStatus::Init);
                self.probes = self
                    .input_channels
                    .iter()
                    .map(|c| SourceProbe::new(format!("input{c}")))
                    .collect();
                self.region.publish(&self.record)?;
                if let Some(id) = req.id {
                    control.send(Message::Response(Response::ok(id, ""))).await?;
                }
                Ok(None)
            }
            other => {
                warn!(stream_id = %self.id, method = other, "unknown command");
                if let Some(id) = req.id {
                    let resp = Response::err(id, ErrorKind::NotFound, "unknown method");
                    control.send(Message::Response(resp)).await?;
                }
                Ok(None)
            }
        }
    }

    async fn apply_event(
        &mut self,
        event: PipelineEvent,
        control: &mut Control,
    ) -> Result<(), WorkerError> {
        match event {
            PipelineEvent::Buffer {
                channel,
                side,
                bytes,
            } => {
                let now = now_ms();
                let (channels, stats) = match side {
                    Side::Input => (&self.input_channels, &mut self.record.input),
                    Side::Output => (&self.output_channels, &mut self.record.output),
                };
                if let Some(pos) = channels.iter().position(|&c| c == channel) {
                    stats[pos].add_bytes(bytes, now);
                } else {
                    warn!(stream_id = %self.id, channel, "buffer for unknown channel");
                }
            }
            PipelineEvent::State(status) => {
                self.set_status(status);
            }
            PipelineEvent::SourceChanged(source) => {
                info!(stream_id = %self.id, source = %source.uri, "active source changed");
                let info = ChangedSourcesInfo {
                    id: self.id.clone(),
                    source,
                };
                let msg = Message::Request(changed_source_stream_broadcast(&info));
                control.send(msg).await?;
            }
            PipelineEvent::Source { channel, kind } => {
                if let Some(pos) = self.input_channels.iter().position(|&c| c == channel) {
                    self.probes[pos].observe(kind);
                }
            }
            // Terminal events are handled by the run loop.
            PipelineEvent::Eos | PipelineEvent::Fatal(_) => {}
        }
        Ok(())
    }

    async fn on_stats_tick(&mut self, control: &mut Control) -> Result<(), WorkerError> {
        let now = now_ms();
        let window = self.stats_interval_secs;
        for ch in self
            .record
            .input
            .iter_mut()
            .chain(self.record.output.iter_mut())
        {
            ch.update_bps(window);
            ch.update_checkpoint();
        }

        let sample = self.sampler.sample(now);
        self.record.cpu_load = sample.cpu_load;
        self.record.rss_bytes = sample.rss_bytes;
        self.record.loop_time_ms = now;
        self.region.publish(&self.record)?;

        let info = StatisticInfo {
            id: self.id.clone(),
            status: self.record.status,
            cpu_load: self.record.cpu_load,
            rss_bytes: self.record.rss_bytes,
            timestamp: now,
            restarts_left: self.record.restarts_left,
            bps_input: self.record.input.iter().map(|c| c.bps()).collect(),
            bps_output: self.record.output.iter().map(|c| c.bps()).collect(),
            total_bytes_input: self.record.input.iter().map(|c| c.total_bytes()).collect(),
            total_bytes_output: self.record.output.iter().map(|c| c.total_bytes()).collect(),
        };
        let msg = Message::Request(statistic_stream_broadcast(&info));
        control.send(msg).await?;
        Ok(())
    }

    fn set_status(&mut self, status: StreamStatus) {
        if self.record.status != status {
            debug!(stream_id = %self.id, from = self.record.status.as_str(), to = status.as_str(), "status");
            self.record.status = status;
        }
    }
}

/// Everything `main` needs to run one worker.
pub struct WorkerArgs {
    pub config: StreamConfig,
    pub feedback_dir: PathBuf,
    pub control_socket: PathBuf,
    pub restarts_left: u32,
}

/// Connect the control socket and run the controller with the built-in
/// backend.  Returns the process exit code.
pub async fn run_worker(args: WorkerArgs) -> Result<i32, WorkerError> {
    let control = UnixStream::connect(&args.control_socket).await?;
    let controller = Controller::new(
        args.config,
        &args.feedback_dir,
        crate::media::SyntheticBackend::default(),
        args.restarts_left,
    )?;
    controller.run(control).await
}
