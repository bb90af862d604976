use std::path::PathBuf;

/// Errors from reading and parsing kernel statistics files.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The file could not be opened or read; carries the offending path.
    #[error("procfs: cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was readable but a required field was missing or malformed.
    #[error("procfs: malformed {}: {field}", file.display())]
    Parse { file: PathBuf, field: &'static str },
}

impl ProcError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(file: impl Into<PathBuf>, field: &'static str) -> Self {
        Self::Parse {
            file: file.into(),
            field,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProcError>;
