use std::panic;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber. Safe to call multiple times;
/// only the first call installs anything.
///
/// Logs go to stdout, and additionally to a daily-rolling file under
/// `OBSERVER_LOG_DIR` when that variable is set. The level filter comes from
/// `OBSERVER_LOG` (default `info`).
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env("OBSERVER_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let writer = match rotating_file_writer() {
            Some(writer) => writer,
            None => BoxMakeWriter::new(std::io::stdout),
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .init();

        install_panic_hook();
    });
}

fn rotating_file_writer() -> Option<BoxMakeWriter> {
    let dir = std::env::var_os("OBSERVER_LOG_DIR")?;
    let dir = std::path::PathBuf::from(dir);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("failed to create OBSERVER_LOG_DIR ({err}); logging to stdout");
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, "observer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Some(BoxMakeWriter::new(non_blocking))
}

/// Route panics through tracing so a crashing background thread leaves a
/// record in the log file before the thread dies.
fn install_panic_hook() {
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| {
        panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("unnamed").to_string();

            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "unknown".to_string());
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic payload not a string".to_string());

            tracing::error!(%thread_name, %location, panic_message = %message, "panic captured");
        }));
    });
}
