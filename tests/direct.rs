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
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::TcpListener;
use tokio::time;

use cert_expiry_exporter::config;
use cert_expiry_exporter::test_helpers::app as testapp;
use cert_expiry_exporter::test_helpers::*;

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_shutdown_lifecycle() {
    helpers::initialize_telemetry();

    let app = cert_expiry_exporter::app::build(Arc::new(test_config(vec![])))
        .await
        .unwrap();

    let shutdown = app.shutdown.trigger().clone();
    let (app, _shutdown) = tokio::join!(
        time::timeout(Duration::from_secs(5), app.wait_termination()),
        shutdown.shutdown_now()
    );
    app.expect("app shuts down")
        .expect("app exits without error")
}

// Check that a port conflict results in the app failing instead of silently failing
#[tokio::test]
async fn test_conflicting_bind_error() {
    helpers::initialize_telemetry();
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = test_config(vec![]);
    cfg.listen_addr = l.local_addr().unwrap();

    assert!(cert_expiry_exporter::app::build(Arc::new(cfg)).await.is_err());
}

#[tokio::test]
async fn test_sources_end_to_end() {
    let cert = helpers::generate_cert(SystemTime::now() + Duration::from_secs(30 * 86_400));
    let remote = helpers::spawn_tls_server(&cert).await;
    let closed = helpers::closed_port().await;

    let sources = format!(
        r#"
certs:
  - name: site
    type: remote
    path: 127.0.0.1
    port: "{remote_port}"
  - name: down
    type: REMOTE
    path: 127.0.0.1
    port: {closed}
    timeout: 2s
  - name: leaf
    type: PEM
    path: {leaf}
  - name: store
    type: JKS
    path: {store}
    passphrase: changeit
  - name: bundle
    type: PKCS12
    path: {bundle}
    passphrase: wrong
  - name: mystery
    type: UNKNOWN
    path: /dev/null
"#,
        remote_port = remote.port(),
        leaf = helpers::testdata("leaf.pem"),
        store = helpers::testdata("keystore.jks"),
        bundle = helpers::testdata("bundle.p12"),
    );
    let path = helpers::write_temp_file("sources.yaml", &sources);
    let cfg = test_config(config::load_sources(&path).unwrap());
    assert_eq!(cfg.sources.len(), 6);

    testapp::with_app(cfg, |app| async move {
        let metrics = app.metrics().await;
        let site = metrics
            .value(
                "certs_expiry_dates",
                labels(&[("certName", "site"), ("certAlias", "127.0.0.1")]),
            )
            .unwrap_or_else(|| panic!("missing site: {}", metrics.dump()));
        assert!(site == 29.0 || site == 30.0, "got {site}");

        let leaf = metrics
            .value("certs_expiry_dates", labels(&[("certName", "leaf")]))
            .unwrap();
        assert!(leaf > 0.0);
        for alias in ["mock-1", "mock-2"] {
            assert!(
                metrics
                    .value(
                        "certs_expiry_dates",
                        labels(&[("certName", "store"), ("certAlias", alias)])
                    )
                    .is_some(),
                "missing {alias}: {}",
                metrics.dump()
            );
        }
        assert_eq!(
            metrics
                .query("certs_expiry_dates", labels(&[("certName", "down")]))
                .unwrap()
                .len(),
            0
        );

        for (name, up) in [
            ("site", 1.0),
            ("down", 0.0),
            ("leaf", 1.0),
            ("store", 1.0),
            ("bundle", 0.0),
            ("mystery", 0.0),
        ] {
            assert_eq!(
                metrics.value("certs_source_up", labels(&[("certName", name)])),
                Some(up),
                "{name}"
            );
        }
        for (name, kind) in [
            ("down", "Connection"),
            ("bundle", "Auth"),
            ("mystery", "UnsupportedFormat"),
        ] {
            assert_eq!(
                metrics.value(
                    "certs_source_failures_total",
                    labels(&[("certName", name), ("kind", kind)])
                ),
                Some(1.0),
                "{name}"
            );
        }

        let (status, body) = app.request(hyper::Method::POST, "/refresh").await;
        assert_eq!(status, 200);
        assert!(body.starts_with("completed with 3/6 successes"), "{body}");

        let (status, body) = app.get("/?format=json").await;
        assert_eq!(status, 200);
        let report: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["succeeded"], 3);
        assert_eq!(report["total"], 6);
        // store contributes two aliases
        assert_eq!(report["results"].as_array().unwrap().len(), 4);

        let metrics = app.metrics().await;
        assert_eq!(
            metrics.value("certs_refreshes_total", HashMap::new()),
            Some(3.0)
        );
        assert_eq!(app.get("/unknown").await.0, 404);
    })
    .await;
}
