//! Process-wide tracing setup.

use std::panic;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::pipeline::stage::panic_message;

/// Directory for rotated log files. Unset logs to stdout.
pub const LOG_DIR_VAR: &str = "LEAD_LOG_DIR";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Route panics through `tracing` with thread and location. Installed once.
///
/// `LEAD_LOG_BACKTRACE=1` also runs the default hook afterwards.
pub fn install_tracing_panic_hook(app_name: &'static str) {
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| {
        let default_hook = panic::take_hook();
        let include_backtrace = std::env::var("LEAD_LOG_BACKTRACE")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        panic::set_hook(Box::new(move |info| {
            let thread = std::thread::current();
            let thread_name = thread.name().unwrap_or("unknown");
            let location = info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

            tracing::error!(
                application = app_name,
                %thread_name,
                location = location.as_deref().unwrap_or("unknown"),
                panic_message = %panic_message(info.payload()),
                "panic captured"
            );

            if include_backtrace {
                default_hook(info);
            }
        }));
    });
}

fn rotating_file_writer(app_name: &str, dir: PathBuf) -> Option<BoxMakeWriter> {
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("failed to create {LOG_DIR_VAR} {}: {err}; logging to stdout", dir.display());
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, format!("{app_name}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);
    Some(BoxMakeWriter::new(non_blocking))
}

/// Initialize the global subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). With `LEAD_LOG_DIR` set,
/// output goes to `<dir>/<app>.log`, rotated daily.
pub fn init_tracing_subscriber(app_name: &'static str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);

    let writer = std::env::var_os(LOG_DIR_VAR)
        .map(PathBuf::from)
        .and_then(|dir| rotating_file_writer(app_name, dir));

    if let Some(writer) = writer {
        let _ = builder.with_ansi(false).with_writer(writer).try_init();
    } else {
        let _ = builder.try_init();
    }
}
