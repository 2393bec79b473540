// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output for the export pipeline.
//!
//! Every line is prefixed so it can be told apart from the host
//! application's own logs:
//!
//! ```text
//! TELEMETRY_EXPORT | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::errors::ConfigError;

const PREFIX: &str = "TELEMETRY_EXPORT";

/// Event formatter writing the `TELEMETRY_EXPORT | LEVEL |` prefix, the
/// active spans and the event fields.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Directives for `log_level`, with the HTTP and TLS stacks silenced.
fn filter_directives(log_level: &str) -> String {
    format!("h2=off,hyper=off,rustls=off,{log_level}")
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed, which leaves
/// the existing one in place.
pub fn init(log_level: &str) -> Result<bool, ConfigError> {
    let filter = EnvFilter::try_new(filter_directives(log_level))
        .map_err(|e| ConfigError::Invalid(format!("log level '{log_level}': {e}")))?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(Formatter)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("Logging subsystem enabled");
    }
    Ok(installed)
}
