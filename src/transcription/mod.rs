/// Bounded ring of recent worker stderr lines
pub mod diagnostics;
/// Request/response correlation for one worker process
pub mod dispatcher;
/// Worker error type
pub mod error;
/// Byte stream to line framing
pub mod framer;
/// Resolving how to start the worker
pub mod launcher;
/// Worker error payload decoding
pub mod normalize;
/// Spawning worker processes
pub mod process;
/// Wire protocol types
pub mod protocol;
/// Recognition operations over the worker
pub mod recognizer;
/// Worker process lifecycle
pub mod supervisor;

#[cfg(test)]
pub(crate) mod fake;

pub use dispatcher::{ProgressFn, RequestOptions};
pub use error::WorkerError;
pub use launcher::{LaunchMode, LaunchSpec, ProcessLauncher, SidecarLauncher};
pub use process::{ChildSpawner, WorkerSpawner};
pub use protocol::{
    AsrModel, AudioPayload, InitOutcome, ModelParams, Progress, PuncModel, RecognitionResult,
    StatusReport, VadModel,
};
pub use recognizer::{RequestTimeouts, Recognizer};
pub use supervisor::{SupervisorPhase, SupervisorSettings, WorkerSupervisor};
