use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use syncloop::error::SyncError;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Captured backtrace wrapper to avoid thiserror's unstable feature detection.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type of the worker process.
///
/// Wraps [`SyncError`] for engine errors and adds variants for process setup.
#[derive(Debug)]
pub enum WorkerError {
    /// Engine, store or schedule error.
    Sync(SyncError),
    /// Configuration or telemetry setup error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// Store migration error.
    Migration(sqlx::migrate::MigrateError, CapturedBacktrace),
    /// I/O error.
    Io(std::io::Error, CapturedBacktrace),
}

impl WorkerError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            WorkerError::Sync(_) => "engine error",
            WorkerError::Config(_, _) => "configuration error",
            WorkerError::Migration(_, _) => "migration error",
            WorkerError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            WorkerError::Sync(err) => err.backtrace(),
            WorkerError::Config(_, cb) => Some(&cb.0),
            WorkerError::Migration(_, cb) => Some(&cb.0),
            WorkerError::Io(_, cb) => Some(&cb.0),
        }
    }

    /// Creates a configuration error from any error.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        WorkerError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a user-oriented report for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("sync worker failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        // Aggregated errors already list every inner error in their display output.
        if !matches!(self, WorkerError::Sync(err) if err.errors().len() > 1) {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Sync(err) => write!(f, "{}", err.message()),
            WorkerError::Config(source, _) => write!(f, "configuration error: {source}"),
            WorkerError::Migration(source, _) => write!(f, "migration error: {source}"),
            WorkerError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for WorkerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerError::Sync(err) => err.source(),
            WorkerError::Config(source, _) => Some(source.as_ref()),
            WorkerError::Migration(source, _) => Some(source),
            WorkerError::Io(source, _) => Some(source),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for WorkerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        WorkerError::Migration(err, CapturedBacktrace::capture())
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<SyncError> for WorkerError {
    fn from(err: SyncError) -> Self {
        WorkerError::Sync(err)
    }
}
