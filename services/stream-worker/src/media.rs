//! The media-framework seam.
//!
//! Element graphs, codec negotiation and HLS segmentation belong to the
//! media framework, not to this crate.  A backend turns a [`PipelineSpec`]
//! into a running pipeline that reports everything the controller needs
//! through a single event channel: delivered buffer sizes, lifecycle state,
//! serialized source events, and source-set changes.
//!
//! [`SyntheticBackend`] is the built-in implementation: it synthesizes a
//! steady buffer cadence, which is exactly what test inputs need and what
//! keeps the control plane fully exercisable without a media stack.

use tokio::sync::{mpsc, watch};
use tv_core::input_uri::InputUri;
use tv_core::{ChannelId, StreamStatus};

use crate::factory::PipelineSpec;

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("pipeline build failed: {0}")]
    Build(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Input,
    Output,
}

/// A serialized (or not) event observed on one source pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEventKind {
    StreamStart,
    FlushStart,
    FlushStop,
    Segment,
    Caps,
    Eos,
    Other { serialized: bool },
}

impl SourceEventKind {
    pub fn is_serialized(self) -> bool {
        match self {
            SourceEventKind::StreamStart
            | SourceEventKind::FlushStop
            | SourceEventKind::Segment
            | SourceEventKind::Caps
            | SourceEventKind::Eos => true,
            SourceEventKind::FlushStart => false,
            SourceEventKind::Other { serialized } => serialized,
        }
    }
}

/// Everything a running pipeline reports back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A buffer of `bytes` was delivered on the given endpoint.
    Buffer {
        channel: ChannelId,
        side: Side,
        bytes: u64,
    },
    State(StreamStatus),
    /// The active source set changed; carries the new source descriptor.
    SourceChanged(InputUri),
    Source {
        channel: ChannelId,
        kind: SourceEventKind,
    },
    Eos,
    Fatal(String),
}

/// Handle to a running pipeline: an event stream plus a shutdown lever.
pub struct PipelineHandle {
    pub events: mpsc::Receiver<PipelineEvent>,
    shutdown: watch::Sender<bool>,
}

impl PipelineHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The replaceable media-framework adapter.
pub trait MediaBackend {
    fn build(&self, spec: &PipelineSpec) -> Result<PipelineHandle, MediaError>;
}

/// Synthesizes a steady buffer cadence across all configured endpoints.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    /// Bytes per buffer per endpoint per tick.
    pub buffer_bytes: u64,
    pub tick_ms: u64,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        // ~1.5 Mbit/s per endpoint at 10 buffers a second.
        SyntheticBackend {
            buffer_bytes: 18_750,
            tick_ms: 100,
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn build(&self, spec: &PipelineSpec) -> Result<PipelineHandle, MediaError> {
        let base = spec.config.base();
        if base.input.is_empty() {
            return Err(MediaError::Build("no inputs".to_owned()));
        }

        let inputs: Vec<InputUri> = base.input.clone();
        let input_channels: Vec<ChannelId> = inputs.iter().map(|i| i.id).collect();
        let output_channels: Vec<ChannelId> = base.output.iter().map(|o| o.id).collect();
        let buffer_bytes = self.buffer_bytes;
        let tick_ms = self.tick_ms;

        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let send = |ev: PipelineEvent| {
                let tx = tx.clone();
                async move { tx.send(ev).await.is_ok() }
            };

            if !send(PipelineEvent::State(StreamStatus::Init)).await {
                return;
            }
            for &channel in &input_channels {
                let start = PipelineEvent::Source {
                    channel,
                    kind: SourceEventKind::StreamStart,
                };
                let segment = PipelineEvent::Source {
                    channel,
                    kind: SourceEventKind::Segment,
                };
                if !send(start).await || !send(segment).await {
                    return;
                }
            }
            // The first source is selected as the active one.
            if !send(PipelineEvent::SourceChanged(inputs[0].clone())).await {
                return;
            }
            if !send(PipelineEvent::State(StreamStatus::Playing)).await {
                return;
            }

            let mut tick = tokio::time::interval(std::time::Duration::from_millis(tick_ms));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = tick.tick() => {
                        for &channel in &input_channels {
                            let buffer = PipelineEvent::Buffer {
                                channel,
                                side: Side::Input,
                                bytes: buffer_bytes,
                            };
                            if !send(buffer).await {
                                return;
                            }
                        }
                        for &channel in &output_channels {
                            let buffer = PipelineEvent::Buffer {
                                channel,
                                side: Side::Output,
                                bytes: buffer_bytes,
                            };
                            if !send(buffer).await {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(PipelineHandle {
            events: rx,
            shutdown: shutdown_tx,
        })
    }
}
