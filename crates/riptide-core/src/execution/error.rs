//! Error types for job execution.

use crate::processor::ProcessorError;

/// Errors that abort a running job.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Two producers of one fan-in edge emitted different watermarks.
    ///
    /// All producers of an edge must emit the same watermark sequence in the
    /// same order.
    #[error(
        "watermark misorder on fan-in: a producer emitted wm({found}) while wm({expected}) is pending"
    )]
    WatermarkMisorder {
        /// The watermark the other producers have reported.
        expected: i64,
        /// The disagreeing watermark.
        found: i64,
    },

    /// A processor returned an error; the job fails with this cause.
    #[error("processor failed in vertex '{vertex}': {source}")]
    ProcessorFailed {
        /// The vertex whose processor failed.
        vertex: String,
        /// The underlying processor error.
        #[source]
        source: ProcessorError,
    },

    /// The job was cancelled from outside.
    #[error("job cancelled")]
    Cancelled,
}
