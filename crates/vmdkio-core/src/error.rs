//! Error types for the vmdkio core library.

use std::path::PathBuf;

/// Broad classification of an [`Error`], for callers that translate errors
/// into their own exception hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed descriptor text.
    Parse,
    /// A backing file is missing, too small or of an unsupported type.
    Resolve,
    /// Corrupt or unsupported sparse extent header.
    Format,
    /// A grain could not be decoded at read time.
    CorruptGrain,
    /// Failure of the underlying byte source.
    Io,
    /// Operation not valid in the current handle state.
    InvalidState,
    /// Feature outside of what this library reads.
    Unsupported,
}

/// The main error type for vmdkio operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The descriptor header section is malformed or misses a required key.
    #[error("malformed descriptor header{}: {message}", line_suffix(*line))]
    MalformedHeader { line: Option<usize>, message: String },

    /// An extent description record could not be parsed.
    #[error("malformed extent description at line {line}: {message}")]
    MalformedExtent { line: usize, message: String },

    /// An extent description names a type this library does not know.
    #[error("unknown extent type '{value}' at line {line}")]
    UnknownExtentType { line: usize, value: String },

    /// A non-zero extent does not name a backing file.
    #[error("extent {extent} does not name a backing file")]
    MissingBackingFile { extent: usize },

    /// The backing file of an extent does not exist.
    #[error("backing file of extent {extent} not found: '{}'", path.display())]
    BackingFileNotFound { extent: usize, path: PathBuf },

    /// The backing file of an extent is smaller than its description requires.
    #[error("backing file of extent {extent} is too small: '{}' has {actual} bytes, expected at least {expected}", path.display())]
    BackingFileTooSmall {
        extent: usize,
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The extent type is known but cannot be read.
    #[error("extent {extent} has unsupported type {extent_type}")]
    UnsupportedExtentType { extent: usize, extent_type: String },

    /// A sparse extent header or grain directory is invalid.
    #[error("sparse extent format error: {message}")]
    Format { message: String },

    /// A grain could not be read or decompressed.
    #[error("corrupt grain {grain} in extent {extent}: {message}")]
    CorruptGrain {
        extent: usize,
        grain: u64,
        message: String,
    },

    /// The requested range lies in an extent with NOACCESS mode.
    #[error("extent {extent} is not accessible")]
    AccessDenied { extent: usize },

    /// The operation is not valid in the current state.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// The image uses a feature this library does not read.
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

fn line_suffix(line: Option<usize>) -> String {
    line.map(|l| format!(" at line {}", l)).unwrap_or_default()
}

/// A specialized Result type for vmdkio operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a header error not tied to a specific line.
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader {
            line: None,
            message: message.into(),
        }
    }

    /// Create a header error for the given 1-based line.
    pub fn malformed_header_at(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedHeader {
            line: Some(line),
            message: message.into(),
        }
    }

    /// Create an extent record error for the given 1-based line.
    pub fn malformed_extent(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedExtent {
            line,
            message: message.into(),
        }
    }

    /// Create a sparse format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a corrupt grain error. The extent index is filled in by the
    /// composer through [`Error::in_extent`].
    pub fn corrupt_grain(grain: u64, message: impl Into<String>) -> Self {
        Self::CorruptGrain {
            extent: 0,
            grain,
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an unsupported feature error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Attach the index of the extent the error originated from.
    pub fn in_extent(self, index: usize) -> Self {
        match self {
            Self::CorruptGrain { grain, message, .. } => Self::CorruptGrain {
                extent: index,
                grain,
                message,
            },
            Self::BackingFileNotFound { path, .. } => Self::BackingFileNotFound {
                extent: index,
                path,
            },
            Self::BackingFileTooSmall {
                path,
                expected,
                actual,
                ..
            } => Self::BackingFileTooSmall {
                extent: index,
                path,
                expected,
                actual,
            },
            Self::UnsupportedExtentType { extent_type, .. } => Self::UnsupportedExtentType {
                extent: index,
                extent_type,
            },
            Self::AccessDenied { .. } => Self::AccessDenied { extent: index },
            Self::MissingBackingFile { .. } => Self::MissingBackingFile { extent: index },
            Self::Format { message } => Self::Format {
                message: format!("extent {}: {}", index, message),
            },
            other => other,
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::MalformedHeader { .. }
            | Self::MalformedExtent { .. }
            | Self::UnknownExtentType { .. } => ErrorKind::Parse,
            Self::MissingBackingFile { .. }
            | Self::BackingFileNotFound { .. }
            | Self::BackingFileTooSmall { .. }
            | Self::UnsupportedExtentType { .. } => ErrorKind::Resolve,
            Self::Format { .. } => ErrorKind::Format,
            Self::CorruptGrain { .. } => ErrorKind::CorruptGrain,
            Self::AccessDenied { .. } | Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, path: None } => source,
            other => {
                let kind = match other.kind() {
                    ErrorKind::InvalidState => std::io::ErrorKind::InvalidInput,
                    ErrorKind::Unsupported => std::io::ErrorKind::Unsupported,
                    ErrorKind::Resolve => std::io::ErrorKind::NotFound,
                    _ => std::io::ErrorKind::InvalidData,
                };
                std::io::Error::new(kind, other)
            }
        }
    }
}
