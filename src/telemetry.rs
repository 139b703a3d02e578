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

//! Log output for the exporter.
//!
//! Events go to stderr, either as JSON objects (`LOG_FORMAT=json`) or as tab separated lines of
//! `timestamp, level, target, message, key=value fields`. The filter starts from `RUST_LOG` and
//! can be changed at runtime through `/logging`.

use std::fmt;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber, info, warn};
use tracing_log::NormalizeEvent;
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, filter, prelude::*, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

// rustls reports every handshake alert, which is routine when probing arbitrary endpoints.
const BASE_DIRECTIVES: &str = "rustls=warn";
const DEFAULT_LEVEL: &str = "info";
const CRATE_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::");

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilterHandle = reload::Handle<filter::Filtered<BoxedLayer, EnvFilter, Registry>, Registry>;

static FILTER: OnceCell<FilterHandle> = OnceCell::new();

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Output {
    Plain,
    Json,
}

impl Output {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Output::Json,
            _ => Output::Plain,
        }
    }

    fn layer(self) -> BoxedLayer {
        match self {
            Output::Json => tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(std::io::stderr)
                .boxed(),
            Output::Plain => tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .fmt_fields(LineFormat)
                .with_writer(std::io::stderr)
                .boxed(),
        }
    }
}

/// Installs the global subscriber. Records from the `log` crate are bridged into it.
pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    let (layer, handle) =
        reload::Layer::new(Output::from_env().layer().with_filter(startup_filter()));
    if FILTER.set(handle).is_err() {
        warn!("log filter handle already installed");
    }
    tracing_subscriber::registry().with(layer).init();
}

fn startup_filter() -> EnvFilter {
    let requested =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_LEVEL.to_string());
    let directives = format!("{BASE_DIRECTIVES},{requested}");
    EnvFilter::builder().parse(&directives).unwrap_or_else(|e| {
        eprintln!(
            "ignoring invalid {}={requested:?}: {e}",
            EnvFilter::DEFAULT_ENV
        );
        EnvFilter::new(format!("{BASE_DIRECTIVES},{DEFAULT_LEVEL}"))
    })
}

/// Appends `level` to the active filter, or to the startup filter when `reset` is set.
/// Later directives override earlier ones for the same target.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let handle = FILTER.get().ok_or(Error::Uninitialized)?;
    let base = if reset {
        startup_filter().to_string()
    } else {
        current_filter(handle)?
    };
    let directives = if level.is_empty() {
        base
    } else {
        format!("{base},{level}")
    };
    let filter = EnvFilter::builder().parse(&directives)?;
    info!(%filter, "updated log filter");
    handle.modify(|layer| *layer.filter_mut() = filter)?;
    Ok(())
}

pub fn get_current_loglevel() -> Result<String, Error> {
    current_filter(FILTER.get().ok_or(Error::Uninitialized)?)
}

fn current_filter(handle: &FilterHandle) -> Result<String, Error> {
    Ok(handle.with_current(|layer| layer.filter().to_string())?)
}

/// Tab separated lines: timestamp, level, target, message, then space separated `key=value`s.
struct LineFormat;

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

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
        // Bridged `log` records carry their real target and level in `log.*` fields.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let target = meta.target();
        write!(
            writer,
            "{}\t{}\t{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level_name(meta.level()),
            target.strip_prefix(CRATE_TARGET).unwrap_or(target),
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

impl<'w> FormatFields<'w> for LineFormat {
    fn format_fields<R: RecordFields>(&self, mut writer: Writer<'w>, fields: R) -> fmt::Result {
        let mut collected = CollectedFields::default();
        fields.record(&mut collected);
        write!(writer, "\t{}", collected.message.unwrap_or_default())?;
        if !collected.pairs.is_empty() {
            write!(writer, "\t{}", collected.pairs.join(" "))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct CollectedFields {
    message: Option<String>,
    pairs: Vec<String>,
}

impl Visit for CollectedFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            name if name.starts_with("log.") => {}
            name => self.pairs.push(format!("{name}={value:?}")),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            name if name.starts_with("log.") => {}
            name => self.pairs.push(format!("{name}={value:?}")),
        }
    }
}
