// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::Debug;
use std::time::Instant;

use once_cell::sync::Lazy;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{Event, Subscriber, field, info, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, Registry, filter, filter::EnvFilter, prelude::*, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";

pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    tracing_subscriber::registry().with(fmt_layer()).init();
}

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    let format = tracing_subscriber::fmt::layer()
        .event_format(format)
        .fmt_fields(format::JsonFields::default());
    Box::new(format)
}

fn plain_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::layer()
        .event_format(PlainFormat())
        .fmt_fields(PlainFormat());
    Box::new(format)
}

fn fmt_layer() -> BoxLayer {
    let format = if env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        json_fmt()
    } else {
        plain_fmt()
    };
    let filter = default_env_filter();
    let (layer, reload) = reload::Layer::new(format.with_filter(filter));
    LOG_HANDLE
        .set(reload)
        .map_or_else(|_| warn!("setup log handler failed"), |_| {});
    Box::new(layer)
}

/// Filter from `RUST_LOG`. A directive that does not parse falls back to `info`.
fn default_env_filter() -> EnvFilter {
    let var = env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse(&var)
        .unwrap_or_else(|e| {
            eprintln!("invalid {}={var}: {e}", EnvFilter::DEFAULT_ENV);
            EnvFilter::new(DEFAULT_FILTER)
        })
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// set_level dynamically updates the logging level to *include* level. If `reset` is true, it will
/// reset the entire logging configuration first.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let Some(handle) = LOG_HANDLE.get() else {
        warn!("failed to get log handle");
        return Err(Error::Uninitialized);
    };
    // Duplicated directives are fine, the EnvFilter parser keeps the last one.
    let new_directive = match handle.with_current(|f| f.filter().to_string()) {
        Ok(_) if reset => format!("{},{level}", default_env_filter()),
        Ok(current) => format!("{current},{level}"),
        Err(_) => level.to_string(),
    };

    let new_filter = EnvFilter::builder().parse(new_directive)?;
    info!("new log filter is {new_filter}");

    Ok(handle.modify(|layer| {
        *layer.filter_mut() = new_filter;
    })?)
}

pub fn get_current_loglevel() -> Result<String, Error> {
    match LOG_HANDLE.get() {
        Some(handle) => Ok(handle.with_current(|f| f.filter().to_string())?),
        None => Err(Error::Uninitialized),
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
}

// PlainFormat writes `time\tlevel\ttarget:spans\tmessage\tk=v ...`.
struct PlainFormat();

struct Visitor<'writer> {
    res: std::fmt::Result,
    is_empty: bool,
    writer: Writer<'writer>,
}

impl Visitor<'_> {
    fn write_padded(&mut self, value: &impl Debug) -> std::fmt::Result {
        let padding = if self.is_empty {
            self.is_empty = false;
            ""
        } else {
            " "
        };
        write!(self.writer, "{padding}{value:?}")
    }
}

impl field::Visit for Visitor<'_> {
    fn record_str(&mut self, field: &field::Field, value: &str) {
        if self.res.is_err() {
            return;
        }

        self.record_debug(field, &value)
    }

    fn record_debug(&mut self, field: &field::Field, val: &dyn std::fmt::Debug) {
        self.res = match field.name() {
            // Message first, then a tab before the k=v fields
            "message" => write!(self.writer, "{val:?}\t"),
            _ => self.write_padded(&format_args!("{}={:?}", field.name(), val)),
        }
    }
}

impl<'writer> FormatFields<'writer> for PlainFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = Visitor {
            writer,
            res: Ok(()),
            is_empty: true,
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for PlainFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::FormatTime;
        use tracing_subscriber::fmt::time::SystemTime;
        let normalized_meta = event.normalized_metadata();
        SystemTime.format_time(&mut writer)?;
        let meta = normalized_meta.as_ref().unwrap_or_else(|| event.metadata());
        write!(
            writer,
            "\t{}\t",
            meta.level().to_string().to_ascii_lowercase()
        )?;

        let target = meta.target();
        let target = target.strip_prefix("authn_k8s::").unwrap_or(target);
        write!(writer, "{target}")?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, ":{}", span.metadata().name())?;
                let ext = span.extensions();
                if let Some(fields) = &ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        };
        if event.fields().any(|_| true) {
            write!(writer, "\t")?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn set_level_before_setup() {
        assert_matches!(set_level(false, "debug"), Err(Error::Uninitialized));
        assert_matches!(get_current_loglevel(), Err(Error::Uninitialized));
    }

    #[test]
    fn bad_directive_falls_back() {
        let filter = EnvFilter::builder()
            .with_regex(false)
            .parse("authn_k8s=notalevel");
        assert!(filter.is_err());
        assert_eq!(EnvFilter::new(DEFAULT_FILTER).to_string(), "info");
    }
}
