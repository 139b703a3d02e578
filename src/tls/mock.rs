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
use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::{TLS_VERSIONS, provider};

/// A self-signed certificate generated for tests.
#[derive(Clone, Debug)]
pub struct TestCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

impl TestCertificate {
    pub fn server_config(&self) -> Arc<ServerConfig> {
        let sc = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(TLS_VERSIONS)
            .expect("server config must be valid")
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(self.cert_der.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone())),
            )
            .unwrap();
        Arc::new(sc)
    }
}

/// Generates a self-signed certificate for `localhost` that expires at `not_after`.
pub fn generate_test_cert(not_after: SystemTime) -> TestCertificate {
    let mut p = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    p.not_before = (not_after - Duration::from_secs(365 * 86_400)).into();
    p.not_after = not_after.into();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    p.distinguished_name = dn;

    let kp = KeyPair::generate().unwrap();
    let cert = p.self_signed(&kp).unwrap();
    TestCertificate {
        cert_pem: cert.pem(),
        key_pem: kp.serialize_pem(),
        cert_der: cert.der().to_vec(),
        key_der: kp.serialize_der(),
    }
}

/// Serves TLS with `cert` on an ephemeral localhost port until the runtime shuts down.
/// Each connection completes the handshake and is then closed.
pub async fn spawn_tls_server(cert: &TestCertificate) -> SocketAddr {
    let acceptor = TlsAcceptor::from(cert.server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, peer)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(socket).await {
                    Ok(mut tls) => {
                        let _ = tls.shutdown().await;
                    }
                    Err(e) => debug!(%peer, "test server handshake failed: {e}"),
                }
            });
        }
    });
    addr
}
