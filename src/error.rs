use thiserror::Error;

/// Errors surfaced by the counter-grid / compactor / pipeline core.
///
/// The driver (`main.rs`, `coverage_cmd.rs`, `mutation_cmd.rs`) wraps these
/// with `anyhow::Context` for user-facing messages; nothing in this enum is
/// locally recoverable (per the error handling design: no retries).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Lazy block allocation (or any other allocation on the hot path)
    /// failed, or a lock guarding a counter grid was poisoned by a panic in
    /// another thread. The source treats `calloc` failure inside `update`
    /// as unchecked; this rewrite instead surfaces it so it can never
    /// silently drop counts.
    #[error("counter grid operation failed: {0}")]
    Fatal(String),

    /// Writing a finished interval (or chrom list) to the `IntervalSink`
    /// failed.
    #[error("interval sink write failed")]
    SinkWrite(#[source] std::io::Error),

    /// Reading the next alignment record from the `RecordSource` failed.
    #[error("failed to read alignment record")]
    SourceRead(#[source] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
