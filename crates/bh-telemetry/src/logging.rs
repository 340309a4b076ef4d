use tracing::Subscriber;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize logging with human-readable output format.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "debug", "bh_supervisor=debug,warn").
///
/// Output goes to stderr so command output on stdout stays machine-readable.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, false);
}

/// Initialize logging with one JSON object per line.
///
/// Safe to call multiple times -- subsequent calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, true);
}

/// Pick the output format from the host config's `general.json_logs` and
/// install it on stderr.
pub fn init(service_name: &str, default_level: &str, json: bool) {
    let installed = subscriber(default_level, json, std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        let format = if json { "json" } else { "human-readable" };
        tracing::info!(service = service_name, format, "logging initialised");
    }
}

/// The subscriber [`init`] installs, writing to `writer` instead of stderr.
pub fn subscriber<W>(default_level: &str, json: bool, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(writer)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    if json {
        Box::new(builder.json().finish())
    } else {
        Box::new(builder.with_thread_ids(false).finish())
    }
}

/// `RUST_LOG` when set and valid, otherwise `default_level`, otherwise `info`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
