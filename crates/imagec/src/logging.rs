//! Log setup: `[SEV][timestamp] message` lines on stderr.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter writing the severity and a local RFC 3339 timestamp
/// with milliseconds in brackets before the message and its fields.
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, false);
        write!(writer, "[{}][{now}] ", event.metadata().level())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter from `--log-level` when given, else `RUST_LOG`, else `info`.
///
/// # Errors
///
/// Returns the parse error of an invalid `--log-level` directive.
pub fn filter(level: Option<&str>) -> Result<EnvFilter, String> {
    match level {
        Some(directive) => EnvFilter::try_new(directive).map_err(|e| e.to_string()),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

/// Install the process-wide subscriber.
///
/// # Errors
///
/// Fails on an invalid directive or when a subscriber is already set.
pub fn init(level: Option<&str>) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .event_format(LineFormat)
        .try_init()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lines_carry_severity_and_timestamp() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("info"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .event_format(LineFormat)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(image = "a.tif", "skipped");
            tracing::debug!("filtered out");
        });

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 1, "{out}");
        let line = lines[0];
        assert!(line.starts_with("[WARN]["), "{line}");
        // 2026-10-19T12:00:00.123+02:00
        let stamp = &line[7..line.find("] ").unwrap()];
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok(), "{stamp}");
        assert_eq!(stamp.split('.').nth(1).unwrap().len(), 9, "{stamp}");
        assert!(line.ends_with("skipped image=\"a.tif\""), "{line}");
    }

    #[test]
    fn explicit_level_overrides_environment() {
        assert!(filter(Some("debug")).is_ok());
        assert!(filter(Some("imagec_engine=trace,info")).is_ok());
        assert!(filter(Some("=[")).is_err());
    }
}
