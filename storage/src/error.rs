use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// What went wrong in a storage driver, independent of the backend.
///
/// Registry code only needs to tell a missing object apart from a backend
/// failure, so the set of kinds is kept small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket does not exist.
    NotFound,

    /// The backend refused the operation.
    PermissionDenied,

    /// Reading or writing the backend failed.
    Io,

    /// The request itself was malformed (bad path, unknown driver).
    InvalidRequest,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    fn from_io(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// Error raised by a storage driver.
///
/// Carries the semantic [`StorageErrorKind`], the engine that failed, the
/// bucket and path involved when known, and the span trace at the point the
/// error was created.
///
/// ```rust
/// use storage::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
/// )
/// .bucket("registry")
/// .path("library/alpine/manifests/sha256/abc")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    span_trace: Box<SpanTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a storage error without bucket or path context.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a storage error from an I/O error, deriving the kind from the
    /// I/O error kind.
    pub fn io(engine: &'static str, error: std::io::Error) -> Self {
        let kind = StorageErrorKind::from_io(error.kind());
        Self::new(engine, kind, error)
    }

    /// Start building a storage error with optional context.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            kind,
            engine,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// Shorthand for a `NotFound` error on a bucket and path.
    pub fn not_found(engine: &'static str, bucket: &str, path: Option<&str>) -> Self {
        let message = match path {
            Some(path) => format!("path not found: {bucket}/{path}"),
            None => format!("bucket not found: {bucket}"),
        };
        let mut builder = Self::builder(
            engine,
            StorageErrorKind::NotFound,
            std::io::Error::new(std::io::ErrorKind::NotFound, message),
        )
        .bucket(bucket);
        if let Some(path) = path {
            builder = builder.path(path);
        }
        builder.build()
    }

    /// Returns a closure converting any error into a storage error of the
    /// given kind, for use with `map_err`.
    pub fn with<E>(engine: &'static str, kind: StorageErrorKind) -> impl FnOnce(E) -> StorageError
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Whether the object (or its bucket) does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Name of the storage engine which produced the error.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The bucket, if known.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// The object path, if known.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Span trace captured when the error was built.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = &self.bucket {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`] with optional bucket, path and context.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set free-form context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the error, capturing the current span trace.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            span_trace: Box::new(SpanTrace::capture()),
        }
    }
}
