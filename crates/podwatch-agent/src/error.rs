/// Errors from recording and folding a CPU profile.
#[derive(Debug, thiserror::Error)]
pub enum ProfilerError {
    /// The target PID is non-positive or has no procfs entry.
    #[error("profiler: invalid PID {0}")]
    InvalidPid(i32),

    /// The sanity probe failed; the kernel refuses to profile this process.
    #[error("profiler: process {0} cannot be profiled")]
    CannotProfile(i32),

    /// Recording overran the hard ceiling and was killed.
    #[error("profiler: recording timed out after {0} seconds")]
    Timeout(u64),

    /// The profiler or stack-folder binary is not installed.
    #[error("profiler: required tool '{0}' not found")]
    ToolMissing(String),

    /// A pipeline stage produced no usable output.
    #[error("profiler: {0} produced no output")]
    EmptyOutput(&'static str),

    #[error("profiler: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("profiler: failed to serialize flame tree: {0}")]
    Serialize(#[from] serde_json::Error),
}
