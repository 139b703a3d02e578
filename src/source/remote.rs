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

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::Error;
use crate::expiry::CertificateRecord;
use crate::tls;

/// Connects to `host:port`, completes a TLS handshake and reads the leaf certificate the
/// server presents. The alias is the host.
pub async fn decode(host: &str, port: u16) -> Result<Vec<CertificateRecord>, Error> {
    let der = fetch_leaf(host, port)
        .await
        .map_err(|e| classify(host, port, e))?;
    Ok(vec![CertificateRecord::from_der(host, &der)?])
}

// A completed handshake without a certificate is a problem with what the server sent,
// everything else failed before a certificate could be read.
fn classify(host: &str, port: u16, e: tls::Error) -> Error {
    match e {
        tls::Error::NoPeerCertificate => Error::Decode(format!("{host}:{port}: {e}")),
        e => Error::Connection(format!("{host}:{port}: {e}")),
    }
}

async fn fetch_leaf(host: &str, port: u16) -> Result<Vec<u8>, tls::Error> {
    let server_name = tls::server_name(host)?;
    let connector = TlsConnector::from(tls::probe_client_config()?);

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(tls::Error::Connect)?;
    trace!(host, port, peer = ?tcp.peer_addr().ok(), "connected");

    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(tls::Error::Handshake)?;
    let (_, session) = stream.get_ref();
    debug!(host, port, version = ?session.protocol_version(), "handshake complete");
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec())
        .ok_or(tls::Error::NoPeerCertificate)?;

    // Best effort; the certificate is already in hand.
    if let Err(e) = stream.shutdown().await {
        trace!(host, port, "close_notify failed: {e}");
    }
    Ok(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::helpers;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn reads_presented_leaf() {
        let not_after = SystemTime::UNIX_EPOCH + Duration::from_secs(1_893_456_000); // 2030-01-01
        let cert = helpers::generate_cert(not_after);
        let addr = helpers::spawn_tls_server(&cert).await;

        let records = decode("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(
            records,
            vec![CertificateRecord {
                alias: "127.0.0.1".to_string(),
                not_after: "20300101000000Z".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn expired_certificates_are_still_read() {
        let not_after = SystemTime::now() - Duration::from_secs(2 * 86_400);
        let cert = helpers::generate_cert(not_after);
        let addr = helpers::spawn_tls_server(&cert).await;

        let records = decode("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alias, "127.0.0.1");
        let days = records[0].days_remaining(chrono::Utc::now()).unwrap();
        assert!(days == -2 || days == -1, "got {days}");
    }

    #[test]
    fn missing_certificate_is_a_decode_failure() {
        assert!(matches!(
            classify("host", 443, tls::Error::NoPeerCertificate),
            Error::Decode(msg) if msg.contains("no certificate")
        ));
        assert!(matches!(
            classify("host", 443, tls::Error::InvalidServerName("host".into())),
            Error::Connection(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_port() {
        let port = helpers::closed_port().await;
        assert!(matches!(
            decode("127.0.0.1", port).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn not_a_tls_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });
        assert!(matches!(
            decode("127.0.0.1", port).await,
            Err(Error::Connection(_))
        ));
    }
}
