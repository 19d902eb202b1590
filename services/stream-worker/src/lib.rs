// stream-worker: one child process, one live media pipeline.
//
// The daemon spawns this binary per stream, hands it a config file, a
// feedback directory and a control socket, and supervises it from outside.
// The pipeline itself lives behind the `media::MediaBackend` seam; this
// crate owns variant selection, source-event consistency checking, metric
// accounting, and the control loop.

pub mod controller;
pub mod factory;
pub mod media;
pub mod probes;

pub use controller::{Controller, WorkerArgs, WorkerError, run_worker};
