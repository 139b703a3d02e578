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

use chrono::{DateTime, NaiveDateTime, Utc};
use x509_parser::certificate::X509Certificate;

use crate::source::Error;

/// Canonical notAfter rendering, e.g. `20300101000000Z`.
pub const NOT_AFTER_FORMAT: &str = "%Y%m%d%H%M%SZ";

const SECONDS_PER_DAY: i64 = 86_400;

/// A single certificate as produced by a decoder, before any time arithmetic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRecord {
    pub alias: String,
    /// notAfter in [NOT_AFTER_FORMAT], always UTC.
    pub not_after: String,
}

impl CertificateRecord {
    /// Decodes a DER certificate and captures its notAfter.
    pub fn from_der(alias: impl Into<String>, der: &[u8]) -> Result<Self, Error> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| Error::Decode(format!("invalid certificate: {e}")))?;
        Ok(CertificateRecord {
            alias: alias.into(),
            not_after: not_after_string(&cert)?,
        })
    }

    /// Days left relative to `now`; negative once expired.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Result<i64, Error> {
        parse_not_after(&self.not_after).map(|not_after| days_remaining(not_after, now))
    }
}

/// Renders the notAfter of a certificate, whether it was encoded as UTCTime or
/// GeneralizedTime, in [NOT_AFTER_FORMAT].
pub fn not_after_string(cert: &X509Certificate) -> Result<String, Error> {
    let ts = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format(NOT_AFTER_FORMAT).to_string())
        .ok_or_else(|| Error::TimeParse(format!("notAfter out of range: {ts}")))
}

pub fn parse_not_after(raw: &str) -> Result<DateTime<Utc>, Error> {
    let bytes = raw.as_bytes();
    let well_formed = bytes.len() == 15
        && bytes[14] == b'Z'
        && bytes[..14].iter().all(u8::is_ascii_digit);
    if !well_formed {
        return Err(Error::TimeParse(raw.to_string()));
    }
    NaiveDateTime::parse_from_str(raw, NOT_AFTER_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|_| Error::TimeParse(raw.to_string()))
}

/// Whole days between `now` and `not_after`. The difference is taken in whole seconds and
/// truncated toward zero, so a certificate that expired a day and a half ago reports -1.
pub fn days_remaining(not_after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds() / SECONDS_PER_DAY
}
