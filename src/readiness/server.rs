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

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response};
use itertools::Itertools;

use crate::hyper_util::{empty_response, plaintext_response};
use crate::readiness;

pub fn handle_ready<T>(ready: &readiness::Ready, req: &Request<T>) -> Response<Full<Bytes>> {
    match *req.method() {
        hyper::Method::GET => {
            let pending = ready.pending();
            if pending.is_empty() {
                return plaintext_response(hyper::StatusCode::OK, "ready\n".into());
            }
            plaintext_response(
                hyper::StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "not ready, pending: {}\n",
                    pending.into_iter().sorted().join(", ")
                ),
            )
        }
        _ => empty_response(hyper::StatusCode::METHOD_NOT_ALLOWED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn reports_pending_tasks() {
        let ready = readiness::Ready::new();
        let b = ready.register_task("b");
        let a = ready.register_task("a");
        let req = Request::new(());

        let resp = handle_ready(&ready, &req);
        assert_eq!(resp.status(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(resp).await, "not ready, pending: a, b\n");

        drop((a, b));
        let resp = handle_ready(&ready, &req);
        assert_eq!(resp.status(), hyper::StatusCode::OK);
        assert_eq!(body(resp).await, "ready\n");

        let post = Request::builder()
            .method(hyper::Method::POST)
            .body(())
            .unwrap();
        assert_eq!(
            handle_ready(&ready, &post).status(),
            hyper::StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
