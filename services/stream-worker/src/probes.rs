//! Source-pad event-order consistency checking.
//!
//! Each source carries an ordering contract: the first serialized event is
//! `stream-start`, `flush-stop` is only valid after `flush-start`, a
//! `segment` must precede `eos`, and two consecutive `eos` are suspicious.
//! Violations never stop the pipeline; they are logged and counted.

use tracing::warn;

use crate::media::SourceEventKind;

#[derive(Debug, Default)]
struct Consistency {
    segment: bool,
    eos: bool,
    expect_flush: bool,
    flushing: bool,
    saw_stream_start: bool,
    saw_serialized_event: bool,
}

/// Order checker for one source.
#[derive(Debug)]
pub struct SourceProbe {
    name: String,
    consistency: Consistency,
    violations: u64,
}

impl SourceProbe {
    pub fn new(name: impl Into<String>) -> Self {
        SourceProbe {
            name: name.into(),
            // A fresh pad is considered post-EOS until a segment arrives.
            consistency: Consistency {
                eos: true,
                ..Consistency::default()
            },
            violations: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    fn violation(&mut self, what: &str) {
        self.violations += 1;
        warn!(probe = %self.name, what, "source event order violation");
    }

    pub fn observe(&mut self, kind: SourceEventKind) {
        match kind {
            SourceEventKind::FlushStart => {
                // Two flush-starts in a row are tolerated.
                self.consistency.flushing = true;
            }
            SourceEventKind::FlushStop => {
                if !self.consistency.flushing {
                    self.violation("flush-stop without flush-start");
                }
                if self.consistency.eos {
                    self.violation("flush-stop after eos");
                }
                self.consistency.flushing = false;
                self.consistency.expect_flush = false;
            }
            SourceEventKind::StreamStart => {
                if self.consistency.saw_serialized_event && !self.consistency.saw_stream_start {
                    self.violation("stream-start after another serialized event");
                }
                self.consistency.saw_stream_start = true;
            }
            SourceEventKind::Caps => {
                // Fine before the segment event.
            }
            SourceEventKind::Segment => {
                if self.consistency.expect_flush && self.consistency.flushing {
                    self.violation("segment during a flushing seek");
                }
                self.consistency.segment = true;
                self.consistency.eos = false;
            }
            SourceEventKind::Eos => {
                if self.consistency.eos {
                    self.violation("eos just after another eos");
                }
                self.consistency.eos = true;
                self.consistency.segment = false;
            }
            SourceEventKind::Other { serialized } => {
                if serialized {
                    if self.consistency.eos {
                        self.violation("event after eos");
                    }
                    if !self.consistency.segment {
                        self.violation("event before segment");
                    }
                }
            }
        }

        if kind.is_serialized() {
            if !self.consistency.saw_stream_start && kind != SourceEventKind::StreamStart {
                self.violation("serialized event before stream-start");
            }
            self.consistency.saw_serialized_event = true;
        }
    }
}
