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

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelValue;
use tracing::{debug, trace};

use crate::config::{SourceConfig, SourceKind};
use crate::expiry::CertificateRecord;

pub mod jks;
pub mod pem;
pub mod pkcs12;
pub mod remote;

/// Days remaining for every certificate alias found in one source.
pub type ExpiryDays = BTreeMap<String, i64>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("invalid notAfter timestamp {0:?}")]
    TimeParse(String),
    #[error("unsupported source type {0:?}")]
    UnsupportedFormat(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, PartialOrd, Ord, EncodeLabelValue)]
#[derive(serde::Serialize)]
pub enum FailureKind {
    NotFound,
    Connection,
    Auth,
    Decode,
    TimeParse,
    UnsupportedFormat,
    Timeout,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::NotFound(_) => FailureKind::NotFound,
            Error::Connection(_) => FailureKind::Connection,
            Error::Auth(_) => FailureKind::Auth,
            Error::Decode(_) => FailureKind::Decode,
            Error::TimeParse(_) => FailureKind::TimeParse,
            Error::UnsupportedFormat(_) => FailureKind::UnsupportedFormat,
            Error::Timeout(_) => FailureKind::Timeout,
        }
    }
}

/// A failure resolving one configured source, tagged with the source name.
#[derive(thiserror::Error, Debug)]
#[error("source {name}: {error}")]
pub struct SourceFailure {
    pub name: String,
    #[source]
    pub error: Error,
}

impl SourceFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

/// Resolves a single source into alias -> days remaining, relative to `now`.
///
/// The decoder runs under `timeout`; timing out is reported like any other failure.
pub async fn resolve(
    cfg: &SourceConfig,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<ExpiryDays, SourceFailure> {
    let wrap = |error| SourceFailure {
        name: cfg.name.clone(),
        error,
    };
    let records = tokio::time::timeout(timeout, decode(cfg))
        .await
        .map_err(|_| wrap(Error::Timeout(timeout)))?
        .map_err(wrap)?;
    debug!(source=%cfg.name, kind=%cfg.kind, certs=records.len(), "decoded source");

    let mut days = ExpiryDays::new();
    for record in records {
        let remaining = record.days_remaining(now).map_err(wrap)?;
        trace!(source=%cfg.name, alias=%record.alias, not_after=%record.not_after, remaining, "computed expiry");
        days.insert(record.alias, remaining);
    }
    Ok(days)
}

async fn decode(cfg: &SourceConfig) -> Result<Vec<CertificateRecord>, Error> {
    match &cfg.kind {
        SourceKind::Remote => remote::decode(&cfg.path, cfg.port()).await,
        SourceKind::Pem => pem::decode(&cfg.path).await,
        SourceKind::Jks => jks::decode(&cfg.path, cfg.passphrase()).await,
        SourceKind::Pkcs12 => pkcs12::decode(&cfg.path, cfg.passphrase()).await,
        SourceKind::Unsupported(kind) => Err(Error::UnsupportedFormat(kind.clone())),
    }
}

pub(crate) async fn read_file(path: &str) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
        _ => Error::Decode(format!("cannot read {path}: {e}")),
    })
}
