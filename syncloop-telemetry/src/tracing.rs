use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{self, Write};
use std::panic::PanicHookInfo;
use std::sync::{Once, OnceLock};

use syncloop_config::Environment;
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_log::LogTracer;
use tracing_log::log_tracer::SetLoggerError;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt};

/// JSON key under which the project reference is injected into production log lines.
const PROJECT_KEY_IN_LOG: &str = "project";

/// Directory receiving production log files.
const LOG_DIR: &str = "logs";

/// Number of daily log files kept around.
const MAX_LOG_FILES: usize = 5;

static PROJECT_REF: OnceLock<String> = OnceLock::new();

static INIT_TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build rolling file appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("an io error occurred: {0}")]
    Io(#[from] io::Error),
}

/// Keeps buffered log lines alive until dropped.
///
/// Hold it for the lifetime of `main`, dropping it flushes pending lines to disk.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

/// Call at the start of a test and run with `ENABLE_TRACING=1` to see the logs:
///
/// ENABLE_TRACING=1 cargo test <test_name>
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            // Without this tests would default to whatever APP_ENVIRONMENT says and could
            // end up writing to files.
            Environment::Dev.set();
            let _log_flusher = init_tracing("test").expect("failed to initialize test tracing");
        }
    });
}

/// Initializes tracing for the application.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    init_tracing_with_project(app_name, None)
}

/// Initializes tracing and tags every production log line with `project_ref`.
pub fn init_tracing_with_project(
    app_name: &str,
    project_ref: Option<String>,
) -> Result<LogFlusher, TracingError> {
    if let Some(project_ref) = project_ref {
        let _ = PROJECT_REF.set(project_ref);
    }

    // Routes records emitted through the `log` crate (sqlx does this) into tracing.
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if Environment::load()?.is_prod() {
        configure_prod_tracing(filter, app_name)?
    } else {
        configure_dev_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

/// JSON lines into a daily rotated file.
fn configure_prod_tracing(filter: EnvFilter, app_name: &str) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix("log")
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .build(LOG_DIR)?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(move || ProjectInjectingWriter::new(file_appender.make_writer()))
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

/// Pretty, colored console output.
fn configure_dev_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

/// Adds the `project` field to JSON log lines when a project reference is configured.
struct ProjectInjectingWriter<W> {
    inner: W,
}

impl<W> ProjectInjectingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for ProjectInjectingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match PROJECT_REF.get().and_then(|project| inject_project(buf, project)) {
            Some(line) => {
                self.inner.write_all(line.as_bytes())?;
                Ok(buf.len())
            }
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Returns the line with `project` added, or `None` if it is not a JSON object or already has one.
fn inject_project(buf: &[u8], project: &str) -> Option<String> {
    let line = std::str::from_utf8(buf).ok()?;
    let serde_json::Value::Object(mut map) = serde_json::from_str(line).ok()? else {
        return None;
    };

    if map.contains_key(PROJECT_KEY_IN_LOG) {
        return None;
    }

    map.insert(
        PROJECT_KEY_IN_LOG.to_owned(),
        serde_json::Value::String(project.to_owned()),
    );

    let mut rendered = serde_json::to_string(&map).ok()?;
    if line.ends_with('\n') {
        rendered.push('\n');
    }

    Some(rendered)
}

/// Chains a panic hook that reports panics through tracing before the default hook runs.
fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        prev_hook(info);
    }));
}

fn panic_hook(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (
            None,
            Some("run with RUST_BACKTRACE=1 to display backtraces"),
        ),
        _ => (None, Some("backtraces are not available")),
    };

    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic_info.payload().downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload");

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        panic.location = location.as_deref(),
        panic.backtrace = backtrace.map(tracing::field::display),
        panic.note = note,
        "a panic occurred",
    );
}
