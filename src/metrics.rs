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

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use serde::Serialize;
use tracing::debug;

use crate::config::SourceConfig;
use crate::source::{ExpiryDays, FailureKind, SourceFailure};

mod meta;
pub mod server;

/// Prefix of every exported metric name.
pub const PREFIX: &str = "certs";

/// Identity of one exported expiry series.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CertKey {
    pub cert_name: String,
    pub cert_alias: String,
    pub cert_path: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
#[allow(non_snake_case)]
struct CertLabels {
    certName: String,
    certAlias: String,
    certPath: String,
}

impl From<&CertKey> for CertLabels {
    fn from(k: &CertKey) -> Self {
        CertLabels {
            certName: k.cert_name.clone(),
            certAlias: k.cert_alias.clone(),
            certPath: k.cert_path.clone(),
        }
    }
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
#[allow(non_snake_case)]
struct SourceLabels {
    certName: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
#[allow(non_snake_case)]
struct FailureLabels {
    certName: String,
    kind: FailureKind,
}

#[derive(Default, Debug)]
struct SourceState {
    expiry: BTreeMap<CertKey, i64>,
    up: bool,
}

/// A consistent copy of the exported expiry values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub expiry: BTreeMap<CertKey, i64>,
    /// Sources whose most recent attempt failed.
    pub unhealthy: BTreeSet<String>,
}

/// Exported certificate metrics.
///
/// Every write that touches a source's series happens under the write lock and exposition
/// happens under the read lock, so a scrape never sees a partially published source.
pub struct MetricSet {
    expiry_days: Family<CertLabels, Gauge>,
    source_up: Family<SourceLabels, Gauge>,
    source_failures: Family<FailureLabels, Counter>,
    refreshes: Counter,
    last_refresh: Gauge,
    #[allow(dead_code)]
    meta: meta::Metrics,

    sources: RwLock<BTreeMap<String, SourceState>>,
}

/// Recorder that can record events
pub trait Recorder<E> {
    /// Record the given event.
    fn record(&self, event: &E);
}

/// A completed refresh pass.
pub struct Refreshed {
    pub at: DateTime<Utc>,
}

impl MetricSet {
    pub fn new(registry: &mut Registry) -> Self {
        let expiry_days = Family::default();
        registry.register(
            "expiry_dates",
            "Days remaining until the certificate expires; negative once expired",
            expiry_days.clone(),
        );
        let source_up = Family::default();
        registry.register(
            "source_up",
            "Whether the most recent attempt to read the source succeeded",
            source_up.clone(),
        );
        let source_failures = Family::default();
        registry.register(
            "source_failures",
            "The total number of failed attempts to read a source, by failure kind",
            source_failures.clone(),
        );
        let refreshes = Counter::default();
        registry.register(
            "refreshes",
            "The total number of completed refresh passes",
            refreshes.clone(),
        );
        let last_refresh = Gauge::default();
        registry.register_with_unit(
            "last_refresh_timestamp",
            "Unix time at which the last refresh pass completed",
            Unit::Seconds,
            last_refresh.clone(),
        );

        Self {
            expiry_days,
            source_up,
            source_failures,
            refreshes,
            last_refresh,
            meta: meta::Metrics::new(registry),
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    /// Publishes a successful resolution of `cfg`. The source's series are replaced by
    /// exactly the aliases in `days`.
    pub fn publish(&self, cfg: &SourceConfig, days: &ExpiryDays) {
        let fresh: BTreeMap<CertKey, i64> = days
            .iter()
            .map(|(alias, days)| {
                let key = CertKey {
                    cert_name: cfg.name.clone(),
                    cert_alias: alias.clone(),
                    cert_path: cfg.path.clone(),
                };
                (key, *days)
            })
            .collect();

        let mut sources = self.write();
        let state = sources.entry(cfg.name.clone()).or_default();
        for stale in state.expiry.keys().filter(|k| !fresh.contains_key(*k)) {
            debug!(source=%stale.cert_name, alias=%stale.cert_alias, "removing stale series");
            self.expiry_days.remove(&CertLabels::from(stale));
        }
        for (key, days) in &fresh {
            self.expiry_days.get_or_create(&key.into()).set(*days);
        }
        state.expiry = fresh;
        state.up = true;
        self.source_up
            .get_or_create(&SourceLabels {
                certName: cfg.name.clone(),
            })
            .set(1);
    }

    /// Marks a source as failed. Previously published values are kept.
    pub fn record_failure(&self, name: &str, kind: FailureKind) {
        let mut sources = self.write();
        sources.entry(name.to_string()).or_default().up = false;
        self.source_up
            .get_or_create(&SourceLabels {
                certName: name.to_string(),
            })
            .set(0);
        self.source_failures
            .get_or_create(&FailureLabels {
                certName: name.to_string(),
                kind,
            })
            .inc();
    }

    pub fn refreshed(&self, at: DateTime<Utc>) {
        self.refreshes.inc();
        self.last_refresh.set(at.timestamp());
    }

    pub fn snapshot(&self) -> Snapshot {
        let sources = self.read();
        let mut snapshot = Snapshot::default();
        for (name, state) in sources.iter() {
            snapshot
                .expiry
                .extend(state.expiry.iter().map(|(k, v)| (k.clone(), *v)));
            if !state.up {
                snapshot.unhealthy.insert(name.clone());
            }
        }
        snapshot
    }

    /// Renders `registry`, which must contain this set, in the text exposition format.
    pub fn encode(&self, registry: &Registry) -> Result<String, std::fmt::Error> {
        let _sources = self.read();
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, registry)?;
        Ok(buf)
    }

    // A panic while holding the lock cannot leave the map half-written, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, SourceState>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, SourceState>> {
        self.sources.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Recorder<SourceFailure> for MetricSet {
    fn record(&self, failure: &SourceFailure) {
        self.record_failure(&failure.name, failure.kind());
    }
}

impl Recorder<Refreshed> for MetricSet {
    fn record(&self, event: &Refreshed) {
        self.refreshed(event.at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceKind;
    use crate::source::Error;

    fn setup() -> (Registry, MetricSet) {
        let mut registry = Registry::default();
        let metrics = MetricSet::new(registry.sub_registry_with_prefix(PREFIX));
        (registry, metrics)
    }

    fn store() -> SourceConfig {
        SourceConfig::new("store", SourceKind::Jks, "/etc/store.jks")
    }

    fn key(alias: &str) -> CertKey {
        CertKey {
            cert_name: "store".to_string(),
            cert_alias: alias.to_string(),
            cert_path: "/etc/store.jks".to_string(),
        }
    }

    #[test]
    fn publish_replaces_aliases() {
        let (registry, metrics) = setup();
        let cfg = store();
        metrics.publish(
            &cfg,
            &ExpiryDays::from([("a".to_string(), 10), ("b".to_string(), 20)]),
        );
        metrics.publish(
            &cfg,
            &ExpiryDays::from([("b".to_string(), 19), ("c".to_string(), 5)]),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.expiry,
            BTreeMap::from([(key("b"), 19), (key("c"), 5)])
        );
        assert!(snapshot.unhealthy.is_empty());

        let text = metrics.encode(&registry).unwrap();
        assert!(!text.contains(r#"certAlias="a""#), "{text}");
        assert!(
            text.contains(
                r#"certs_expiry_dates{certName="store",certAlias="c",certPath="/etc/store.jks"} 5"#
            ),
            "{text}"
        );
    }

    #[test]
    fn failure_retains_last_values() {
        let (registry, metrics) = setup();
        let cfg = store();
        metrics.publish(&cfg, &ExpiryDays::from([("a".to_string(), 10)]));
        metrics.record(&SourceFailure {
            name: "store".to_string(),
            error: Error::Auth("bad password".to_string()),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.expiry, BTreeMap::from([(key("a"), 10)]));
        assert_eq!(snapshot.unhealthy, BTreeSet::from(["store".to_string()]));

        let text = metrics.encode(&registry).unwrap();
        assert!(text.contains(r#"certs_source_up{certName="store"} 0"#), "{text}");
        assert!(
            text.contains(r#"certs_source_failures_total{certName="store",kind="Auth"} 1"#),
            "{text}"
        );
        assert!(text.contains(r#"certAlias="a""#), "{text}");

        // Recovery marks the source healthy again.
        metrics.publish(&cfg, &ExpiryDays::from([("a".to_string(), 9)]));
        assert!(metrics.snapshot().unhealthy.is_empty());
    }

    #[test]
    fn never_succeeded_has_no_series() {
        let (registry, metrics) = setup();
        metrics.record_failure("down", FailureKind::Connection);
        let snapshot = metrics.snapshot();
        assert!(snapshot.expiry.is_empty());
        assert_eq!(snapshot.unhealthy, BTreeSet::from(["down".to_string()]));
        let text = metrics.encode(&registry).unwrap();
        assert!(!text.contains("certs_expiry_dates{"), "{text}");
    }

    #[test]
    fn refresh_and_build_info() {
        let (registry, metrics) = setup();
        let at = DateTime::<Utc>::from_timestamp(1_800_000_000, 0).unwrap();
        metrics.record(&Refreshed { at });
        let text = metrics.encode(&registry).unwrap();
        assert!(text.contains("certs_refreshes_total 1"), "{text}");
        assert!(
            text.contains("certs_last_refresh_timestamp_seconds 1800000000"),
            "{text}"
        );
        assert!(text.contains("certs_exporter_build{tag="), "{text}");
    }
}
