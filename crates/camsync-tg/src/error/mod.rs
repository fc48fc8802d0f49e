mod ext;
mod macros;

use crate::prelude::*;
use crate::util::DynError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing_error::SpanTrace;

pub(crate) use macros::*;

pub(crate) mod prelude {
    pub(crate) use super::ext::{OptionExt as _, ResultExt as _};
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Describes any possible error that may happen in the application lifetime.
#[derive(Clone)]
pub struct Error {
    imp: Arc<ErrorImp>,
}

struct ErrorImp {
    /// Small identifier used for debugging purposes.
    /// It is mentioned in the chat when the error happens.
    /// This way we as developers can copy it and lookup the logs using this id.
    id: String,
    kind: ErrorKind,

    // Participates only in debug impl
    spantrace: SpanTrace,
}

#[derive(Error, Debug)]
pub(crate) enum ErrorKind {
    #[error(transparent)]
    Command {
        #[from]
        source: crate::tg::CommandError,
    },

    #[error(transparent)]
    HttpClient {
        #[from]
        source: crate::http::HttpClientError,
    },

    #[error(transparent)]
    Download {
        #[from]
        source: crate::download::DownloadError,
    },

    #[error(transparent)]
    Photos {
        #[from]
        source: crate::photos::PhotosError,
    },

    #[error(transparent)]
    Device {
        #[from]
        source: crate::device::DeviceError,
    },

    #[error(transparent)]
    Watch {
        #[from]
        source: crate::watcher::WatchError,
    },

    #[error(transparent)]
    Tg {
        #[from]
        source: teloxide::RequestError,
    },

    #[error(transparent)]
    Io {
        #[from]
        source: IoError,
    },

    /// Unrecoverable kind of error, that is not supposed to happen, but when
    /// it happens we can't do anything reasonable about it, so no structural
    /// error handling is possible, this error is just propagated to the top.
    #[error("FATAL: {message}")]
    Fatal {
        message: String,
        source: Option<Box<DynError>>,
    },
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io { source: err.into() }
    }
}

#[derive(Debug, Error)]
pub(crate) enum IoError {
    #[error("Failed to create the temporary directory `{path}`")]
    CreateTempDir { path: String, source: std::io::Error },

    #[error("File `{path}` already exists")]
    FileExists { path: String },

    #[error("Failed to move `{from}` to `{to}`")]
    MoveFile {
        from: String,
        to: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn id(&self) -> &str {
        &self.imp.id
    }

    /// Errors caused by interaction with the user.
    /// These are most likely caused by the operator sending wrong input.
    pub(crate) fn is_user_error(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::Command { .. } => true,
            ErrorKind::HttpClient { .. }
            | ErrorKind::Download { .. }
            | ErrorKind::Photos { .. }
            | ErrorKind::Device { .. }
            | ErrorKind::Watch { .. }
            | ErrorKind::Tg { .. }
            | ErrorKind::Io { .. }
            | ErrorKind::Fatal { .. } => false,
        }
    }

    /// Cancellation is an expected outcome, it must not be reported as a failure.
    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(
            &self.imp.kind,
            ErrorKind::Download {
                source: crate::download::DownloadError::Cancelled
            }
        )
    }

    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.imp.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error (id: {}): {}", self.imp.id, self.imp.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.imp.kind.source()
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)?;
        fmt::Display::fmt(&self.imp.spantrace, f)
    }
}

impl<T: Into<ErrorKind>> From<T> for Error {
    #[track_caller]
    fn from(kind: T) -> Self {
        let kind: ErrorKind = kind.into();

        let imp = ErrorImp {
            kind,
            id: nanoid::nanoid!(6),
            spantrace: SpanTrace::capture(),
        };

        let err = Self { imp: Arc::new(imp) };

        trace!(err = tracing_err(&err), "Created an error");

        err
    }
}
