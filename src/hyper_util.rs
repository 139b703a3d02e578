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

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn empty_response(code: hyper::StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .body(Full::default())
        .expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("builder with known status code should not fail")
}

pub fn json_response<T: serde::Serialize>(code: hyper::StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec_pretty(body) {
        Ok(body) => Response::builder()
            .status(code)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .expect("builder with known status code should not fail"),
        Err(e) => plaintext_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode response: {e}\n"),
        ),
    }
}

/// Server implements a generic HTTP server with the follow behavior:
/// * HTTP/1.1 plaintext only
/// * Stops accepting and drains open connections once `cancel` fires
pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    cancel: CancellationToken,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        cancel: CancellationToken,
        s: S,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            cancel,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Serves requests with `f` until cancelled. The returned handle completes once every
    /// open connection has finished.
    pub fn spawn<F, R>(self, f: F) -> JoinHandle<()>
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
    {
        info!(
            address=%self.addr,
            component=%self.name,
            "listener established",
        );
        let Server {
            name,
            listener,
            cancel,
            state,
            ..
        } = self;
        let f = Arc::new(f);
        let mut http = hyper::server::conn::http1::Builder::new();
        http.timer(TokioTimer::new())
            .half_close(true)
            .header_read_timeout(Duration::from_secs(2))
            .max_buf_size(8 * 1024);
        let graceful = GracefulShutdown::new();

        tokio::spawn(async move {
            loop {
                let (socket, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("{name}: failed to accept connection: {e}");
                            continue;
                        }
                    },
                };
                let state = state.clone();
                let f = f.clone();
                let svc = hyper::service::service_fn(move |req| f(state.clone(), req));
                let conn = graceful.watch(http.serve_connection(TokioIo::new(socket), svc));
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(%peer, "{name}: connection error: {e}");
                    }
                });
            }
            info!("starting drain of {name} server");
            drop(listener);
            graceful.shutdown().await;
            info!("{name} server terminated");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_until_cancelled() {
        let cancel = CancellationToken::new();
        let server = Server::bind("test", "127.0.0.1:0".parse().unwrap(), cancel.clone(), "hello")
            .await
            .unwrap();
        let addr = server.address();
        let handle = server.spawn(|state, _req| async move {
            Ok(plaintext_response(hyper::StatusCode::OK, state.to_string()))
        });

        let body = crate::test_helpers::helpers::http_get(addr, "/").await;
        assert_eq!(body, (200, "hello".to_string()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
