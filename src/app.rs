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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::collector::Collector;
use crate::metrics::{MetricSet, PREFIX};
use crate::{admin, config, readiness, signal};

/// Wires the metric set, collector and HTTP surface together and starts them.
pub async fn build(config: Arc<config::Config>) -> anyhow::Result<Bound> {
    let mut registry = Registry::default();
    let metrics = Arc::new(MetricSet::new(registry.sub_registry_with_prefix(PREFIX)));
    let registry = Arc::new(registry);

    let shutdown = signal::Shutdown::new();
    // Cancelling stops the refresh loop and begins draining the HTTP server.
    let cancel = CancellationToken::new();

    let ready = readiness::Ready::new();
    let initial_refresh = ready.register_task("initial refresh");

    let collector = Arc::new(Collector::new(
        config.sources.clone(),
        metrics.clone(),
        config.source_timeout,
    ));

    let service = admin::Service::new(
        admin::State {
            config: config.clone(),
            collector: collector.clone(),
            metrics,
            registry,
            ready,
        },
        cancel.clone(),
    )
    .await
    .context("exporter server starts")?;
    let address = service.address();

    let server_task = service.spawn();
    let collector_task = tokio::spawn(
        collector
            .run(config.refresh_interval, cancel.clone(), initial_refresh)
            .in_current_span(),
    );

    Ok(Bound {
        address,
        shutdown,
        config,
        cancel,
        tasks: vec![server_task, collector_task],
    })
}

pub struct Bound {
    pub address: SocketAddr,

    pub shutdown: signal::Shutdown,
    config: Arc<config::Config>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bound {
    pub async fn wait_termination(self) -> anyhow::Result<()> {
        let Bound {
            shutdown,
            config,
            cancel,
            tasks,
            ..
        } = self;
        // Wait for a signal to shutdown from an explicit trigger or signal
        shutdown.wait().await;
        drain(config.termination_grace_period, cancel, tasks).await
    }

    /// Stops refreshing and drains the server without waiting for a shutdown signal.
    pub async fn terminate(self) -> anyhow::Result<()> {
        drain(self.config.termination_grace_period, self.cancel, self.tasks).await
    }
}

// Cancels the refresh loop and the server, waiting at most `grace` for both to finish.
async fn drain(
    grace: Duration,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
) -> anyhow::Result<()> {
    cancel.cancel();
    match time::timeout(grace, futures::future::join_all(tasks)).await {
        Ok(_) => info!("Shutdown completed gracefully"),
        Err(_) => warn!(
            "Graceful shutdown did not complete in {:?}, terminating now",
            grace
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{helpers, test_config};

    #[tokio::test]
    async fn wait_termination_returns_after_trigger() {
        helpers::initialize_telemetry();
        let bound = build(Arc::new(test_config(vec![]))).await.unwrap();
        let address = bound.address;
        let trigger = bound.shutdown.trigger();

        let waiter = tokio::spawn(bound.wait_termination());
        time::timeout(Duration::from_secs(5), async {
            while helpers::http_get(address, "/healthz/ready").await.0 != 200 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        trigger.shutdown_now().await;
        time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }

    #[tokio::test]
    async fn terminate_without_signal() {
        let bound = build(Arc::new(test_config(vec![]))).await.unwrap();
        let address = bound.address;
        time::timeout(Duration::from_secs(5), bound.terminate())
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(address).await.is_err());
    }
}
