use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Route pipeline events to stdout and to `logs/cast_pipeline.log`.
///
/// Stage progress goes to the console as plain text. The log file gets one
/// JSON object per event and rolls over daily. `RUST_LOG` overrides the
/// default `cast_pipeline=info` filter. Drop the returned guard only after
/// the last stage has finished, or buffered file lines are lost.
pub fn init_logging() -> WorkerGuard {
    // A missing log directory only costs the file layer.
    let _ = fs::create_dir_all("logs");

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        "logs",
        "cast_pipeline.log",
    ));
    let json_file = fmt::layer().json().with_writer(file_writer);
    let console = fmt::layer().with_writer(std::io::stdout);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cast_pipeline=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_file)
        .with(console)
        .init();

    guard
}
