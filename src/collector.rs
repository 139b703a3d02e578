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

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::metrics::{MetricSet, Recorder, Refreshed};
use crate::readiness::BlockReady;
use crate::source::{self, FailureKind, SourceFailure};

/// Source of the current instant. Injectable so results are reproducible in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum State {
    Idle,
    Refreshing,
}

/// Days remaining for one alias of one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryResult {
    pub source_name: String,
    pub alias: String,
    pub path: String,
    pub days_remaining: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub source: String,
    pub kind: FailureKind,
    pub message: String,
}

impl From<&SourceFailure> for FailureReport {
    fn from(f: &SourceFailure) -> Self {
        FailureReport {
            source: f.name.clone(),
            kind: f.kind(),
            message: f.error.to_string(),
        }
    }
}

/// Outcome of one refresh pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RefreshReport {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<FailureReport>,
    pub results: Vec<ExpiryResult>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "completed with {}/{} successes",
            self.succeeded, self.total
        )?;
        for failure in &self.failures {
            write!(
                f,
                "\n  {}: {:?}: {}",
                failure.source, failure.kind, failure.message
            )?;
        }
        Ok(())
    }
}

/// Resolves every configured source and publishes the outcome into the metric set.
pub struct Collector {
    sources: Vec<SourceConfig>,
    metrics: Arc<MetricSet>,
    default_timeout: Duration,
    clock: Clock,

    // Serializes passes; a trigger arriving mid-pass waits and then runs its own.
    lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
}

impl Collector {
    pub fn new(
        sources: Vec<SourceConfig>,
        metrics: Arc<MetricSet>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            sources,
            metrics,
            default_timeout,
            clock: Arc::new(Utc::now),
            lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn state(&self) -> State {
        if self.refreshing.load(Ordering::Acquire) {
            State::Refreshing
        } else {
            State::Idle
        }
    }

    /// Runs one refresh pass. Sources are resolved concurrently and published in configured
    /// order; a failing source never prevents the others from being published.
    pub async fn refresh(&self) -> RefreshReport {
        let _serialized = self.lock.lock().await;
        let _refreshing = RefreshingGuard::enter(&self.refreshing);

        let now = (self.clock)();
        debug!(sources = self.sources.len(), %now, "starting refresh");
        let outcomes = join_all(self.sources.iter().map(|cfg| {
            let timeout = cfg.timeout.unwrap_or(self.default_timeout);
            source::resolve(cfg, now, timeout)
        }))
        .await;

        let mut report = RefreshReport {
            total: self.sources.len(),
            ..Default::default()
        };
        for (cfg, outcome) in self.sources.iter().zip(outcomes) {
            match outcome {
                Ok(days) => {
                    self.metrics.publish(cfg, &days);
                    report.succeeded += 1;
                    report
                        .results
                        .extend(days.into_iter().map(|(alias, days_remaining)| ExpiryResult {
                            source_name: cfg.name.clone(),
                            alias,
                            path: cfg.path.clone(),
                            days_remaining,
                        }));
                }
                Err(failure) => {
                    warn!(source=%failure.name, kind=?failure.kind(), "failed to read source: {}", failure.error);
                    self.metrics.record(&failure);
                    report.failures.push((&failure).into());
                }
            }
        }

        self.metrics.record(&Refreshed { at: (self.clock)() });
        info!(
            succeeded = report.succeeded,
            total = report.total,
            "refresh completed with {}/{} successes",
            report.succeeded,
            report.total
        );
        report
    }

    /// Refreshes immediately, releases `ready`, then refreshes every `interval` until
    /// `cancel` fires. A zero interval only runs the initial pass.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        ready: BlockReady,
    ) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.refresh() => {}
        }
        drop(ready);

        if interval.is_zero() {
            info!("periodic refresh disabled");
            cancel.cancelled().await;
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("refresh loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}

struct RefreshingGuard<'a>(&'a AtomicBool);

impl<'a> RefreshingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        RefreshingGuard(flag)
    }
}

impl Drop for RefreshingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
