//! Error types and result definitions for sync orchestration.
//!
//! [`SyncError`] carries a classification ([`ErrorKind`]), a static description, optional dynamic
//! detail, an optional source error and the callsite where it was created. Several errors can be
//! aggregated into one, which is how worker pools report multiple failed runs.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type using [`SyncError`] as the error type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Detailed payload stored for single [`SyncError`] instances.
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the orchestration core.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Single error payload holding rich metadata.
    Single(ErrorPayload),
    /// Multiple aggregated errors, mainly produced when several run workers fail.
    Many {
        errors: Vec<SyncError>,
        location: &'static Location<'static>,
    },
}

/// Categories of errors that can occur while orchestrating sync runs.
///
/// The kind drives retry classification in [`crate::workers::policy`], so step executors should
/// pick the most specific kind available.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Step execution errors
    SourceConnectionFailed,
    DestinationConnectionFailed,
    SourceQueryFailed,
    DestinationQueryFailed,
    SourceError,
    DestinationError,
    StepTimeout,
    InvalidData,
    ValidationError,
    NonRetryable,

    // Durable store errors
    StoreConnectionFailed,
    StoreQueryFailed,
    CorruptHistory,

    // Control surface errors
    RunNotFound,
    ScheduleNotFound,
    DuplicateSchedule,
    RunAlreadyActive,
    UnknownWorkflowKind,
    InvalidCronExpression,
    InvalidState,

    // Configuration, IO and serialization errors
    ConfigError,
    IoError,
    SerializationError,
    DeserializationError,

    // Worker errors
    RunWorkerPanic,
    ScheduleTriggerPanic,

    // Unknown / uncategorized
    Unknown,
}

impl SyncError {
    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or [`ErrorKind::Unknown`]
    /// if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the static description of this error.
    ///
    /// Aggregated errors return the description of their first error.
    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.description.as_ref(),
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.description())
                .unwrap_or("multiple errors occurred"),
        }
    }

    /// Returns the detailed error information if available.
    ///
    /// For multiple errors, returns the detail of the first error that has one.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, or a single element slice for single errors.
    pub fn errors(&self) -> &[SyncError] {
        match self.repr {
            ErrorRepr::Single(_) => std::slice::from_ref(self),
            ErrorRepr::Many { ref errors, .. } => errors,
        }
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Renders the error as the single line message persisted in run history.
    ///
    /// Unlike [`fmt::Display`] this omits the callsite and backtrace.
    pub fn message(&self) -> String {
        match self.detail() {
            Some(detail) => format!("{}: {detail}", self.description()),
            None => self.description().to_owned(),
        }
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    ///
    /// Has no effect on aggregated errors, which forward their first error as the source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        SyncError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (
                ErrorRepr::Many {
                    errors: errors_a, ..
                },
                ErrorRepr::Many {
                    errors: errors_b, ..
                },
            ) => errors_a == errors_b,
            _ => false,
        }
    }
}

impl Hash for SyncError {
    /// Hashes only the kind and static description so that occurrences of the same failure
    /// group together regardless of detail or callsite.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                write_detail(payload.detail.as_deref(), f, 1)?;
                write_backtrace(payload.backtrace.as_ref(), f, 1)?;

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if errors.is_empty() {
                    write!(f, "\n  (no inner errors provided)")?;
                }

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    match lines.next() {
                        Some(first_line) => write!(f, "\n  {}. {}", index + 1, first_line)?,
                        None => write!(f, "\n  {}.", index + 1)?,
                    }

                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

/// Writes the captured backtrace with indentation, skipping it when capture is disabled.
fn write_backtrace(
    backtrace: &Backtrace,
    f: &mut fmt::Formatter<'_>,
    indent: usize,
) -> fmt::Result {
    if backtrace.status() != BacktraceStatus::Captured {
        return Ok(());
    }

    let indent_str = "  ".repeat(indent);
    write!(f, "\n{indent_str}Backtrace:")?;
    for line in backtrace.to_string().lines() {
        if line.trim().is_empty() {
            write!(f, "\n{indent_str}  ")?;
        } else {
            write!(f, "\n{indent_str}  {line}")?;
        }
    }

    Ok(())
}

/// Writes the detail block with indentation.
fn write_detail(detail: Option<&str>, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let Some(detail) = detail else {
        return Ok(());
    };

    let indent_str = "  ".repeat(indent);
    if detail.trim().is_empty() {
        return write!(f, "\n{indent_str}Detail: <empty>");
    }

    write!(f, "\n{indent_str}Detail:")?;
    for line in detail.lines() {
        write!(f, "\n{indent_str}  {line}")?;
    }

    Ok(())
}

/// Creates a [`SyncError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SyncError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`SyncError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for SyncError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> SyncError {
        SyncError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates several errors into one.
///
/// A vector holding exactly one error yields that error unchanged.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> SyncError {
        let location = Location::caller();
        let mut errors: Vec<SyncError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        SyncError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for SyncError {
    #[track_caller]
    fn from(err: std::io::Error) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O error occurred"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps syntax and data failures to [`ErrorKind::DeserializationError`], since serialization of
/// the crate's own types cannot fail on data.
impl From<serde_json::Error> for SyncError {
    #[track_caller]
    fn from(err: serde_json::Error) -> SyncError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<sqlx::Error> for SyncError {
    #[track_caller]
    fn from(err: sqlx::Error) -> SyncError {
        let kind = match &err {
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                ErrorKind::StoreConnectionFailed
            }
            sqlx::Error::RowNotFound => ErrorKind::InvalidState,
            _ => ErrorKind::StoreQueryFailed,
        };

        let detail = err.to_string();
        SyncError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<crate::schedule::cron::CronParseError> for SyncError {
    #[track_caller]
    fn from(err: crate::schedule::cron::CronParseError) -> SyncError {
        let detail = err.to_string();
        SyncError::from_components(
            ErrorKind::InvalidCronExpression,
            Cow::Borrowed("Invalid cron expression"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}
