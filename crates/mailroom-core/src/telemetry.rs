use std::fmt as StdFmt;
use std::sync::OnceLock;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::AppConfig;

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Initialize structured logging (RUST_LOG driven).
/// JSON output is used for production; pretty output for dev.
pub fn init_telemetry(app: &AppConfig) -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let json_format = !app.env.eq_ignore_ascii_case("dev");
    if json_format {
        let fmt_layer = fmt::layer().event_format(JsonFormatter::default());
        install_subscriber(fmt_layer, env_filter)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr);
        install_subscriber(fmt_layer, env_filter)?;
    }

    let _ = INSTALLED.set(());
    Ok(())
}

fn install_subscriber(
    fmt_layer: impl tracing_subscriber::Layer<Registry> + Send + Sync + 'static,
    env_filter: EnvFilter,
) -> Result<(), TelemetryError> {
    let subscriber = Registry::default().with(fmt_layer).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
}

/// Basic logging initializer for early binaries/tests that do not yet wire full config.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailroom".to_string(),
        env: env.to_string(),
    };
    init_telemetry(&app)
}

#[derive(Default)]
struct JsonFormatter;

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let span_name = ctx.lookup_current().map(|span| span.name().to_string());

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": span_name,
            "fields": visitor.fields,
        });

        let serialized = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writer.write_str(&serialized)?;
        writer.write_str("\n")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl tracing_subscriber::field::Visit for JsonVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string().into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn StdFmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}").into());
    }
}
