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
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;
use crate::config::Config;
use crate::hyper_util::{Server, empty_response, json_response, plaintext_response};
use crate::metrics::MetricSet;
use crate::metrics::server::handle_metrics;
use crate::readiness::{self, handle_ready};
use crate::telemetry;
use crate::version::BuildInfo;

/// Everything the HTTP surface reads from.
pub struct State {
    pub config: Arc<Config>,
    pub collector: Arc<Collector>,
    pub metrics: Arc<MetricSet>,
    pub registry: Arc<Registry>,
    pub ready: readiness::Ready,
}

/// HTTP server exposing metrics, refresh triggers, readiness and log level control.
pub struct Service {
    s: Server<State>,
}

#[derive(serde::Serialize, Debug)]
pub struct ConfigDump<'a> {
    version: BuildInfo,
    config: &'a Config,
}

impl Service {
    pub async fn new(state: State, cancel: CancellationToken) -> anyhow::Result<Self> {
        let addr = state.config.listen_addr;
        Server::<State>::bind("exporter", addr, cancel, state)
            .await
            .map(|s| Service { s })
            .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        self.s
            .spawn(|state, req| async move { Ok(handle(&state, req).await) })
    }
}

pub async fn handle<T>(state: &State, req: Request<T>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" | "/stats/prometheus" => handle_metrics(&state.metrics, &state.registry, &req),
        "/" | "/refresh" => {
            let json = wants_json(&req);
            handle_refresh(&state.collector, req.method(), json).await
        }
        "/healthz/ready" => handle_ready(&state.ready, &req),
        "/logging" => handle_logging(&req),
        "/config_dump" => handle_config_dump(&state.config, &req),
        _ => empty_response(hyper::StatusCode::NOT_FOUND),
    }
}

async fn handle_refresh(
    collector: &Collector,
    method: &hyper::Method,
    json: bool,
) -> Response<Full<Bytes>> {
    match *method {
        hyper::Method::GET | hyper::Method::POST => {
            let report = collector.refresh().await;
            if json {
                json_response(hyper::StatusCode::OK, &report)
            } else {
                plaintext_response(hyper::StatusCode::OK, format!("{report}\n"))
            }
        }
        _ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn handle_config_dump<T>(config: &Config, req: &Request<T>) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::GET => json_response(
            hyper::StatusCode::OK,
            &ConfigDump {
                version: BuildInfo::new(),
                config,
            },
        ),
        _ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn query_params<T>(req: &Request<T>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|v| {
            url::form_urlencoded::parse(v.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn wants_json<T>(req: &Request<T>) -> bool {
    if let Some(format) = query_params(req).get("format") {
        return format.eq_ignore_ascii_case("json");
    }
    req.headers()
        .get_all(http::header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| {
            v.split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        })
}

//mirror envoy's behavior: https://www.envoyproxy.io/docs/envoy/latest/operations/admin#post--logging
//NOTE: multiple query parameters is not supported, for example
//curl -X POST http://127.0.0.1:9100/logging?"level=warn&level=debug"
static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}={level1},{mod2}={level2}\t(To change specific mods' logging level)
usage: POST /logging?reset\t\t\t\t\t(To reset to the startup level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. cert_expiry_exporter::collector
";

fn handle_logging<T>(req: &Request<T>) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::POST => {
            let qp = query_params(req);
            let level = qp.get("level").cloned();
            let reset = qp.get("reset").cloned();
            if level.is_some() || reset.is_some() {
                change_log_level(reset.is_some(), &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            hyper::StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Full<Bytes>> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => plaintext_response(
            hyper::StatusCode::OK,
            format!("current log level is {loglevel}\n"),
        ),
        Err(err) => plaintext_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Full<Bytes>> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            hyper::StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;

    use super::*;
    use crate::config::{SourceConfig, SourceKind, construct_config};
    use crate::metrics::PREFIX;
    use crate::test_helpers::helpers;

    fn state(sources: Vec<SourceConfig>) -> State {
        let mut registry = Registry::default();
        let metrics = Arc::new(MetricSet::new(registry.sub_registry_with_prefix(PREFIX)));
        let collector = Collector::new(sources.clone(), metrics.clone(), Duration::from_secs(5))
            .with_clock(Arc::new(|| Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap()));
        State {
            config: Arc::new(construct_config("sources.yaml".into(), sources).unwrap()),
            collector: Arc::new(collector),
            metrics,
            registry: Arc::new(registry),
            ready: readiness::Ready::new(),
        }
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn sources() -> Vec<SourceConfig> {
        vec![
            SourceConfig::new("leaf", SourceKind::Pem, helpers::testdata("leaf.pem")),
            SourceConfig::new("gone", SourceKind::Pem, "/nonexistent/gone.pem"),
        ]
    }

    #[tokio::test]
    async fn refresh_then_scrape() {
        let state = state(sources());

        let resp = handle(&state, get("/refresh")).await;
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        let text = body(resp).await;
        assert!(text.starts_with("completed with 1/2 successes\n  gone: NotFound:"), "{text}");

        let metrics = body(handle(&state, get("/metrics")).await).await;
        let leaf = helpers::testdata("leaf.pem");
        assert!(
            metrics.contains(&format!(
                r#"certs_expiry_dates{{certName="leaf",certAlias="{leaf}",certPath="{leaf}"}} 1171"#
            )),
            "{metrics}"
        );
        assert!(metrics.contains(r#"certs_source_up{certName="gone"} 0"#), "{metrics}");
    }

    #[tokio::test]
    async fn refresh_as_json() {
        let state = state(sources());
        for req in [
            get("/?format=json"),
            Request::builder()
                .uri("/refresh")
                .method(hyper::Method::POST)
                .header("Accept", "text/html, application/json;q=0.9")
                .body(())
                .unwrap(),
        ] {
            let resp = handle(&state, req).await;
            assert_eq!(
                resp.headers()[hyper::header::CONTENT_TYPE],
                "application/json"
            );
            let report: serde_json::Value = serde_json::from_str(&body(resp).await).unwrap();
            assert_eq!(report["total"], 2);
            assert_eq!(report["succeeded"], 1);
            assert_eq!(report["failures"][0]["source"], "gone");
            assert_eq!(report["failures"][0]["kind"], "NotFound");
            assert_eq!(report["results"][0]["sourceName"], "leaf");
            assert_eq!(report["results"][0]["daysRemaining"], 1171);
        }
    }

    #[tokio::test]
    async fn routes() {
        let state = state(vec![]);
        assert_eq!(
            handle(&state, get("/nope")).await.status(),
            hyper::StatusCode::NOT_FOUND
        );
        assert_eq!(
            handle(&state, get("/healthz/ready")).await.status(),
            hyper::StatusCode::OK
        );
        let delete = Request::builder()
            .uri("/refresh")
            .method(hyper::Method::DELETE)
            .body(())
            .unwrap();
        assert_eq!(
            handle(&state, delete).await.status(),
            hyper::StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            handle(&state, get("/logging")).await.status(),
            hyper::StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn config_dump_hides_passphrases() {
        let mut store = SourceConfig::new("store", SourceKind::Jks, "/etc/store.jks");
        store.passphrase = Some("hunter2".to_string());
        let state = state(vec![store]);
        let dump = body(handle(&state, get("/config_dump")).await).await;
        assert!(dump.contains("\"store\""), "{dump}");
        assert!(!dump.contains("hunter2"), "{dump}");
    }

    #[test]
    fn json_negotiation() {
        assert!(wants_json(&get("/?format=json")));
        assert!(!wants_json(&get("/?format=text")));
        assert!(!wants_json(&get("/")));
        let accept = Request::builder()
            .header("Accept", "application/json")
            .body(())
            .unwrap();
        assert!(wants_json(&accept));
        let overridden = Request::builder()
            .uri("/?format=text")
            .header("Accept", "application/json")
            .body(())
            .unwrap();
        assert!(!wants_json(&overridden));
    }
}
