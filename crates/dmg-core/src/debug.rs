use core::fmt;
use core::fmt::Write;
use std::fs::OpenOptions;
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracingfmt};


#[macro_export]
macro_rules! unimplemented_log {
    ( $($arg:tt)* ) => {{
        tracing::warn!("not modelled: {}", format_args!($($arg)*));
    }};
}

/// Soft assertion: a false `cond` is logged as a warning with its source location.
#[macro_export]
macro_rules! assert_warn {
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            tracing::warn!(
                "{}:{}: `{}` does not hold: {}",
                file!(),
                line!(),
                stringify!($cond),
                format_args!($($arg)+),
            );
        }
    }};
}

/// Log line layout: level, simulation time when the event carries a `ts`
/// field, the emitting crate and module, then the message
struct SimFormatter;

/// Fields of one event, with the simulation timestamp kept apart
#[derive(Default)]
struct SimEventFields {
    ts: Option<String>,
    message: String,
    extra: String,
}

impl tracing::field::Visit for SimEventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "ts" => self.ts = Some(format!("{:?}", value)),
            "message" => self.message = format!("{:?}", value),
            name => {
                let _ = write!(self.extra, " {}={:?}", name, value);
            }
        }
    }
}

fn level_color(level: &tracing::Level) -> &'static str {
    match *level {
        tracing::Level::ERROR => "\x1b[31m",
        tracing::Level::WARN => "\x1b[33m",
        tracing::Level::INFO => "\x1b[32m",
        tracing::Level::DEBUG => "\x1b[34m",
        tracing::Level::TRACE => "\x1b[35m",
    }
}

/// "dmg_mac::block_ack" becomes "mac/block_ack"
fn short_target(target: &str) -> String {
    let mut parts = target.split("::");
    let krate = parts.next().unwrap_or(target);
    let krate = krate.strip_prefix("dmg_").unwrap_or(krate);
    match parts.next() {
        Some(module) => format!("{}/{}", krate, module),
        None => krate.to_string(),
    }
}

impl<S, N> FormatEvent<S, N> for SimFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = SimEventFields::default();
        event.record(&mut fields);

        let level = metadata.level();
        if writer.has_ansi_escapes() {
            write!(writer, "{}{:<5}\x1b[0m", level_color(level), level)?;
        } else {
            write!(writer, "{:<5}", level)?;
        }
        let ts = fields.ts.as_deref().unwrap_or("");
        let target = short_target(metadata.target());
        writeln!(writer, " {:>12} {:<22} {}{}", ts, target, fields.message, fields.extra)
    }
}

static LOGGING: Once = Once::new();

/// Everything at trace level into the test writer. Safe to call from every test.
pub fn setup_logging_verbose() {
    install(EnvFilter::new("trace"), None, true);
}

/// Console logging at the usual levels, plus a debug-level file when `log_path` is set.
/// The returned guard flushes the file writer on drop, so hold it until exit.
pub fn setup_logging_default(log_path: Option<String>) -> Option<WorkerGuard> {
    let file = log_path.map(|path| (path, EnvFilter::new("debug")));
    install(get_default_stdout_filter(), file, false)
}

pub fn get_default_stdout_filter() -> EnvFilter {
    EnvFilter::new("info")
        // Per-frame chatter
        .add_directive(directive("dmg_core::event_queue=warn"))
        .add_directive(directive("dmg_core::frame_buf=warn"))
        .add_directive(directive("dmg_mac::medium=warn"))
        .add_directive(directive("dmg_mac::mac_low=info"))
        .add_directive(directive("dmg_mac::block_ack=info"))
        .add_directive(directive("dmg_mac::txop=info"))

        // Admission decisions are the interesting part
        .add_directive(directive("dmg_scheduler=debug"))
        .add_directive(directive("dmg_mac::dmg_mac=debug"))
}

fn directive(s: &'static str) -> tracing_subscriber::filter::Directive {
    // Static strings above are known-good
    s.parse().unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into())
}

fn install(console_filter: EnvFilter, file: Option<(String, EnvFilter)>, test_writer: bool) -> Option<WorkerGuard> {
    let mut guard = None;
    let file_layer = file.and_then(|(path, filter)| match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => {
            let (writer, g) = tracing_appender::non_blocking(f);
            guard = Some(g);
            Some(
                tracingfmt::layer()
                    .event_format(SimFormatter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(filter),
            )
        }
        Err(e) => {
            eprintln!("cannot open log file {}: {}, logging to console only", path, e);
            None
        }
    });

    LOGGING.call_once(move || {
        let console = tracingfmt::layer().event_format(SimFormatter);
        let console = if test_writer {
            console.with_test_writer().boxed()
        } else {
            console.boxed()
        };
        tracing_subscriber::registry()
            .with(file_layer)
            .with(console.with_filter(console_filter))
            .init();
    });
    guard
}
