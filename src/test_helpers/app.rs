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

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use prometheus_parse::Scrape;

use crate::*;

use super::helpers::*;

#[derive(Clone, Copy)]
pub struct TestApp {
    pub address: SocketAddr,
}

pub async fn with_app<F, Fut, FO>(cfg: config::Config, f: F)
where
    F: Fn(TestApp) -> Fut,
    Fut: Future<Output = FO>,
{
    initialize_telemetry();
    let app = app::build(Arc::new(cfg)).await.unwrap();
    let shutdown = app.shutdown.trigger().clone();

    let ta = TestApp {
        address: app.address,
    };
    let run_and_shutdown = async {
        ta.ready().await;
        f(ta).await;
        shutdown.shutdown_now().await;
    };
    let (app, _shutdown) = tokio::join!(app.wait_termination(), run_and_shutdown);
    app.expect("app exits without error");
}

impl TestApp {
    pub async fn request(&self, method: hyper::Method, path: &str) -> (u16, String) {
        http_request(self.address, method, path, None).await
    }

    pub async fn get(&self, path: &str) -> (u16, String) {
        http_get(self.address, path).await
    }

    pub async fn metrics(&self) -> ParsedMetrics {
        let (_, body) = self.get("/metrics").await;
        let iter = body.lines().map(|x| Ok::<_, io::Error>(x.to_string()));
        let scrape = prometheus_parse::Scrape::parse(iter).unwrap();
        ParsedMetrics { scrape }
    }

    /// Waits for the initial refresh pass to complete.
    pub async fn ready(&self) {
        for _ in 0..500 {
            if self.get("/healthz/ready").await.0 == 200 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("exporter did not become ready");
    }
}

pub struct ParsedMetrics {
    scrape: Scrape,
}

impl ParsedMetrics {
    pub fn query(
        &self,
        metric: &str,
        labels: HashMap<String, String>,
    ) -> Option<Vec<&prometheus_parse::Sample>> {
        if !self
            .scrape
            .docs
            .contains_key(metric.strip_suffix("_total").unwrap_or(metric))
        {
            return None;
        }
        Some(
            self.scrape
                .samples
                .iter()
                .filter(|s| s.metric == metric)
                .filter(|s| superset_of(s.labels.deref(), &labels))
                .collect(),
        )
    }

    /// Value of the single sample of `metric` matching `labels`, if there is exactly one.
    pub fn value(&self, metric: &str, labels: HashMap<String, String>) -> Option<f64> {
        let samples = self.query(metric, labels)?;
        match samples.as_slice() {
            [sample] => match sample.value {
                prometheus_parse::Value::Counter(f)
                | prometheus_parse::Value::Gauge(f)
                | prometheus_parse::Value::Untyped(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn dump(&self) -> String {
        format!("{:?}", self.scrape.samples)
    }
}

fn superset_of(base: &HashMap<String, String>, check: &HashMap<String, String>) -> bool {
    for (k, v) in check {
        if base.get(k) != Some(v) {
            return false;
        }
    }
    true
}
