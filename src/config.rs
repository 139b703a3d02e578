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

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

const CERT_EXPORTER_CONFIG: &str = "CERT_EXPORTER_CONFIG";
const LISTEN_ADDR: &str = "LISTEN_ADDR";
const LISTEN_HOST: &str = "LISTEN_HOST";
const LISTEN_PORT: &str = "LISTEN_PORT";
const REFRESH_INTERVAL: &str = "REFRESH_INTERVAL";
const SOURCE_TIMEOUT: &str = "SOURCE_TIMEOUT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";

const DEFAULT_CONFIG_PATH: &str = "/config.json";
const DEFAULT_LISTEN_PORT: u16 = 9100;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);

pub const DEFAULT_TLS_PORT: u16 = 443;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Address serving metrics, refresh triggers and readiness.
    pub listen_addr: SocketAddr,

    /// File the certificate sources were loaded from.
    pub sources_path: PathBuf,
    pub sources: Vec<SourceConfig>,

    /// How often the collector refreshes on its own. Zero disables the timer,
    /// leaving only explicit triggers.
    pub refresh_interval: Duration,
    /// Upper bound for a single source, unless the source sets its own.
    pub source_timeout: Duration,
    pub termination_grace_period: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("failed to read sources file {0}: {1}")]
    SourcesFile(PathBuf, std::io::Error),
    #[error("error parsing sources file {0}: {1}")]
    SourcesParse(PathBuf, String),
    #[error("invalid source {0:?}: {1}")]
    InvalidSource(String, String),
    #[error("duplicate source name {0:?}")]
    DuplicateSource(String),
}

/// The container format a source is read as.
///
/// Unknown `type` values are kept rather than rejected so the collector can report them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    Remote,
    Pem,
    Jks,
    Pkcs12,
    Unsupported(String),
}

impl From<String> for SourceKind {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "REMOTE" | "URL" | "TLS" => SourceKind::Remote,
            "PEM" => SourceKind::Pem,
            "JKS" => SourceKind::Jks,
            "PKCS12" | "PKCS" | "P12" | "PFX" => SourceKind::Pkcs12,
            _ => SourceKind::Unsupported(s),
        }
    }
}

impl From<SourceKind> for String {
    fn from(k: SourceKind) -> Self {
        k.to_string()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Remote => f.write_str("REMOTE"),
            SourceKind::Pem => f.write_str("PEM"),
            SourceKind::Jks => f.write_str("JKS"),
            SourceKind::Pkcs12 => f.write_str("PKCS12"),
            SourceKind::Unsupported(s) => f.write_str(s),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// Hostname for remote sources, file path otherwise.
    pub path: String,
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind, path: impl Into<String>) -> Self {
        SourceConfig {
            name: name.into(),
            kind,
            path: path.into(),
            port: None,
            passphrase: None,
            timeout: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TLS_PORT)
    }

    pub fn passphrase(&self) -> &str {
        self.passphrase.as_deref().unwrap_or_default()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSource(
                self.path.clone(),
                "name must not be empty".to_string(),
            ));
        }
        if self.path.trim().is_empty() {
            return Err(Error::InvalidSource(
                self.name.clone(),
                "path must not be empty".to_string(),
            ));
        }
        if self.port == Some(0) {
            return Err(Error::InvalidSource(
                self.name.clone(),
                "port must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

// Ports show up both as numbers and as strings in existing configs.
#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

fn deserialize_port<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    match Option::<PortValue>::deserialize(d)? {
        None => Ok(None),
        Some(PortValue::Number(p)) => Ok(Some(p)),
        Some(PortValue::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {s:?}"))),
    }
}

fn deserialize_timeout<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|s| duration_str::parse(&s).map_err(|e| serde::de::Error::custom(e.to_string())))
        .transpose()
}

/// HumanDuration wraps a Duration to parse strings such as "90s" or "5m"
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(HumanDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str, default: Duration) -> Result<Duration, Error> {
    parse::<HumanDuration>(env).map(|v| v.map(|d| d.0).unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    let sources_path: PathBuf = parse_default(CERT_EXPORTER_CONFIG, DEFAULT_CONFIG_PATH.into())?;
    let sources = load_sources(&sources_path)?;
    construct_config(sources_path, sources)
}

pub fn construct_config(sources_path: PathBuf, sources: Vec<SourceConfig>) -> Result<Config, Error> {
    let listen_addr = match parse::<SocketAddr>(LISTEN_ADDR)? {
        Some(addr) => addr,
        None => SocketAddr::new(
            parse_default(LISTEN_HOST, IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            parse_default(LISTEN_PORT, DEFAULT_LISTEN_PORT)?,
        ),
    };

    Ok(Config {
        listen_addr,
        sources_path,
        sources,
        refresh_interval: parse_duration(REFRESH_INTERVAL, DEFAULT_REFRESH_INTERVAL)?,
        source_timeout: parse_duration(SOURCE_TIMEOUT, DEFAULT_SOURCE_TIMEOUT)?,
        termination_grace_period: parse_duration(
            TERMINATION_GRACE_PERIOD,
            DEFAULT_DRAIN_DURATION,
        )?,
    })
}

pub fn load_sources(path: &Path) -> Result<Vec<SourceConfig>, Error> {
    let data = std::fs::read_to_string(path).map_err(|e| Error::SourcesFile(path.into(), e))?;
    parse_sources(&data).map_err(|e| match e {
        Error::SourcesParse(_, msg) => Error::SourcesParse(path.into(), msg),
        e => e,
    })
}

/// Parses a list of sources. YAML and JSON are both accepted, either as a bare list or
/// wrapped in a single-key mapping such as `{"certs": [...]}`.
pub fn parse_sources(data: &str) -> Result<Vec<SourceConfig>, Error> {
    let perr = |e: serde_yaml::Error| Error::SourcesParse(PathBuf::new(), e.to_string());
    let doc: serde_yaml::Value = serde_yaml::from_str(data).map_err(perr)?;
    let list = match doc {
        serde_yaml::Value::Sequence(_) => doc,
        serde_yaml::Value::Mapping(m) => match m.into_iter().next() {
            Some((_, list)) => list,
            None => serde_yaml::Value::Sequence(Vec::new()),
        },
        serde_yaml::Value::Null => serde_yaml::Value::Sequence(Vec::new()),
        _ => {
            return Err(Error::SourcesParse(
                PathBuf::new(),
                "expected a list of sources".to_string(),
            ));
        }
    };
    let sources: Vec<SourceConfig> = serde_yaml::from_value(list).map_err(perr)?;

    let mut seen = HashSet::new();
    for s in &sources {
        s.validate()?;
        if !seen.insert(s.name.as_str()) {
            return Err(Error::DuplicateSource(s.name.clone()));
        }
    }
    Ok(sources)
}
