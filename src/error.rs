use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while constructing writer chains or pushing entries
/// through them.
///
/// Construction failures are fatal for the whole output range; conversion
/// failures are fatal for the batch that triggered them. The only
/// self-healing behaviour in the crate is the per-class skip inside
/// [`DexBatch`](crate::dex::DexBatch), which never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot create output file `{}`", .path.display())]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create output directory `{}`", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write entry `{name}`")]
    WriteEntry {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot add `{name}` to archive")]
    AddArchiveEntry {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Cannot finish archive for `{name}`")]
    FinishArchive {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Cannot convert collected classes to dex `{name}`")]
    ConvertDex {
        name: String,
        #[source]
        source: ConversionError,
    },

    #[error("Invalid name filter `{pattern}`")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Cannot build conversion thread pool")]
    ThreadPool {
        #[source]
        source: rayon::ThreadPoolBuildError,
    },

    #[error("No output entries in class path range {from}..{to}")]
    EmptyOutputRange { from: usize, to: usize },
}

/// Failure reported by the external dex-conversion engine.
///
/// Always batch-fatal: the pending batch is discarded and the error is
/// surfaced to whoever triggered the finalize, wrapped in
/// [`Error::ConvertDex`]. No retries.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("dex engine exited with {status}: {stderr}")]
    EngineFailed { status: String, stderr: String },

    #[error("dex engine produced no output container")]
    MissingOutput,

    #[error("cannot invoke dex engine")]
    Invoke(#[from] std::io::Error),
}
