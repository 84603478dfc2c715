// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by filesystem operations.
///
/// Every variant that names a path carries the user-visible path, stamped
/// at the outermost frame that knows it (see [`Error::with_path`]).
/// `Invariant` and `Crypto` report bugs or tampering rather than
/// conditions a caller is expected to handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("path not found: {path}")]
    NotFound { path: String },

    #[error("entry already exists: {path}")]
    AlreadyExists { path: String },

    #[error("not a folder: {path}")]
    NotFolder { path: String },

    #[error("not a file: {path}")]
    NotFile { path: String },

    #[error("not a link: {path}")]
    NotLink { path: String },

    #[error("is a folder: {path}")]
    IsFolder { path: String },

    #[error("folder is not empty: {path}")]
    NotEmpty { path: String },

    #[error("unexpected end of object bytes: {path}")]
    EndOfBytes { path: String },

    #[error("operation not permitted: {path}")]
    NotPermitted { path: String },

    #[error("node is busy: {path}")]
    Busy { path: String },

    #[error("storage io failure: {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("concurrent update of object {obj}")]
    ConcurrentUpdate { obj: String },

    #[error("cannot parse content of {path}")]
    Parsing {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("operation is not implemented")]
    NotImplemented,

    #[error("byte source has no known end: {path}")]
    Endless { path: String },

    #[error("version mismatch on {path}: expected {expected}, found {found}")]
    VersionMismatch {
        path: String,
        expected: u64,
        found: u64,
    },

    #[error("attributes are not enabled in this filesystem")]
    AttrsNotEnabled,

    #[error("storage is closed: {path}")]
    StorageClosed { path: String },

    #[error("bad argument: {message}")]
    BadArg { message: String },

    #[error("invariant violated: {message}")]
    Invariant { message: String },

    #[error("cryptographic verification failed: {message}")]
    Crypto { message: String },
}

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Error::AlreadyExists { path: path.into() }
    }

    pub fn not_folder(path: impl Into<String>) -> Self {
        Error::NotFolder { path: path.into() }
    }

    pub fn not_file(path: impl Into<String>) -> Self {
        Error::NotFile { path: path.into() }
    }

    pub fn not_link(path: impl Into<String>) -> Self {
        Error::NotLink { path: path.into() }
    }

    pub fn is_folder(path: impl Into<String>) -> Self {
        Error::IsFolder { path: path.into() }
    }

    pub fn not_empty(path: impl Into<String>) -> Self {
        Error::NotEmpty { path: path.into() }
    }

    pub fn end_of_bytes(path: impl Into<String>) -> Self {
        Error::EndOfBytes { path: path.into() }
    }

    pub fn not_permitted(path: impl Into<String>) -> Self {
        Error::NotPermitted { path: path.into() }
    }

    pub fn busy(path: impl Into<String>) -> Self {
        Error::Busy { path: path.into() }
    }

    pub fn concurrent_update(obj: impl Into<String>) -> Self {
        Error::ConcurrentUpdate { obj: obj.into() }
    }

    pub fn parsing(
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Parsing {
            path: path.into(),
            source: Box::new(source),
        }
    }

    pub fn endless(path: impl Into<String>) -> Self {
        Error::Endless { path: path.into() }
    }

    pub fn version_mismatch(path: impl Into<String>, expected: u64, found: u64) -> Self {
        Error::VersionMismatch {
            path: path.into(),
            expected,
            found,
        }
    }

    pub fn storage_closed(path: impl Into<String>) -> Self {
        Error::StorageClosed { path: path.into() }
    }

    pub fn bad_arg(message: impl Into<String>) -> Self {
        Error::BadArg {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant {
            message: message.into(),
        }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Error::Crypto {
            message: message.into(),
        }
    }

    /// Replace an empty or inner-frame path with the user-visible one.
    ///
    /// Inner frames often know only a child name or nothing at all; the
    /// outermost frame that resolved the full path re-stamps it here.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        match &mut self {
            Error::NotFound { path: p }
            | Error::AlreadyExists { path: p }
            | Error::NotFolder { path: p }
            | Error::NotFile { path: p }
            | Error::NotLink { path: p }
            | Error::IsFolder { path: p }
            | Error::NotEmpty { path: p }
            | Error::EndOfBytes { path: p }
            | Error::NotPermitted { path: p }
            | Error::Busy { path: p }
            | Error::Io { path: p, .. }
            | Error::Parsing { path: p, .. }
            | Error::Endless { path: p }
            | Error::VersionMismatch { path: p, .. }
            | Error::StorageClosed { path: p } => *p = path,
            _ => {}
        }
        self
    }

    /// The path carried by this error, when it has one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::NotFound { path }
            | Error::AlreadyExists { path }
            | Error::NotFolder { path }
            | Error::NotFile { path }
            | Error::NotLink { path }
            | Error::IsFolder { path }
            | Error::NotEmpty { path }
            | Error::EndOfBytes { path }
            | Error::NotPermitted { path }
            | Error::Busy { path }
            | Error::Io { path, .. }
            | Error::Parsing { path, .. }
            | Error::Endless { path }
            | Error::VersionMismatch { path, .. }
            | Error::StorageClosed { path } => Some(path),
            _ => None,
        }
    }
}
