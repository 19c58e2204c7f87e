use log::error;
use thiserror::Error;

/// The fatal error kinds of the demultiplexer.
///
/// Demultiplexing is offline batch work and partial output is worse than no
/// output, so every one of these terminates the run: configuration problems
/// surface through `main`, and errors detected inside pipeline threads go
/// through [`fatal`].
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to read {path}: {source}")]
    InputIo {
        path: String,
        source: std::io::Error,
    },

    #[error("corrupt gzip stream in {path}: {reason}")]
    CorruptGzip { path: String, reason: String },

    #[error("malformed FASTQ record {record} in {path}: {reason}")]
    MalformedRecord {
        path: String,
        record: u64,
        reason: String,
    },

    #[error("failed to write {path}: {source}")]
    OutputIo {
        path: String,
        source: std::io::Error,
    },

    #[error("read has no Illumina {0} in its name line, please confirm that this is Illumina data")]
    IndexUnavailable(&'static str),
}

/// Report an error and terminate the process.
///
/// Pipeline threads cannot propagate a `Result` back through the scope while
/// other stages keep running, and no writer holds uncommitted data beyond one
/// buffer, so the first thread to hit a fatal condition ends the run here.
pub fn fatal(err: impl std::fmt::Display) -> ! {
    error!("{err}");
    std::process::exit(1);
}
