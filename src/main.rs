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

use std::sync::Arc;

use cert_expiry_exporter::collector::Collector;
use cert_expiry_exporter::metrics::{MetricSet, PREFIX};
use cert_expiry_exporter::*;
use prometheus_client::registry::Registry;
use tracing::info;

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    let command = std::env::args().nth(1);
    match command.as_deref() {
        None | Some("serve") | Some("check") => (),
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };
    let config = Arc::new(config::parse_config()?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    if command.as_deref() == Some("check") {
        let ok = runtime.block_on(check(config))?;
        if !ok {
            std::process::exit(1)
        }
        return Ok(());
    }
    runtime.block_on(serve(config))
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Certificate Expiry Exporter ({version})

Commands:
serve (default) - Serve certificate expiry metrics, refreshing periodically
check           - Run a single refresh, print the report and exit non-zero on failures
version         - Print the version of the exporter
help            - Print commands and version of the exporter"
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn serve(cfg: Arc<config::Config>) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);
    app::build(cfg).await?.wait_termination().await
}

async fn check(cfg: Arc<config::Config>) -> anyhow::Result<bool> {
    let mut registry = Registry::default();
    let metrics = Arc::new(MetricSet::new(registry.sub_registry_with_prefix(PREFIX)));
    let collector = Collector::new(cfg.sources.clone(), metrics, cfg.source_timeout);
    let report = collector.refresh().await;
    println!("{report}");
    for r in &report.results {
        println!(
            "{}\t{}\t{}\t{}",
            r.source_name, r.alias, r.path, r.days_remaining
        );
    }
    Ok(report.is_success())
}
