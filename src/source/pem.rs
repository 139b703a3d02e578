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

use std::io::Cursor;

use rustls_pemfile::Item;

use super::{Error, read_file};
use crate::expiry::CertificateRecord;

/// Reads the first certificate of a PEM file. The alias is the file path.
pub async fn decode(path: &str) -> Result<Vec<CertificateRecord>, Error> {
    let data = read_file(path).await?;
    let record = parse(path, &data)?;
    Ok(vec![record])
}

pub fn parse(alias: &str, data: &[u8]) -> Result<CertificateRecord, Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(data));
    // Keys and other blocks may precede the certificate in combined files.
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| Error::Decode(format!("{alias}: invalid PEM: {e}")))?;
        if let Item::X509Certificate(der) = item {
            return CertificateRecord::from_der(alias, &der);
        }
    }
    Err(Error::Decode(format!("{alias}: no certificate")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::helpers;

    #[tokio::test]
    async fn decode_leaf() {
        let path = helpers::testdata("leaf.pem");
        let records = decode(&path).await.unwrap();
        assert_eq!(
            records,
            vec![CertificateRecord {
                alias: path,
                not_after: "20300101000000Z".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn expired_leaf() {
        let records = decode(&helpers::testdata("expired.pem")).await.unwrap();
        assert_eq!(records[0].not_after, "20200101000000Z");
    }

    #[test]
    fn key_before_certificate() {
        let mut combined = std::fs::read(helpers::testdata("leaf.key")).unwrap();
        combined.extend(std::fs::read(helpers::testdata("leaf.pem")).unwrap());
        let record = parse("combined", &combined).unwrap();
        assert_eq!(record.not_after, "20300101000000Z");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse("empty", b""), Err(Error::Decode(_))));
        assert!(matches!(
            parse("text", b"this is not a certificate"),
            Err(Error::Decode(_))
        ));
        let malformed = std::fs::read(helpers::testdata("malformed.pem")).unwrap();
        assert!(matches!(parse("bad", &malformed), Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn missing_file() {
        assert!(matches!(
            decode("/nonexistent/leaf.pem").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn generated_certificate() {
        let now = std::time::SystemTime::now();
        let cert = helpers::generate_cert(now + std::time::Duration::from_secs(10 * 86_400));
        let record = parse("generated", cert.cert_pem.as_bytes()).unwrap();
        let days = record.days_remaining(chrono::Utc::now()).unwrap();
        assert!(days == 9 || days == 10, "got {days}");
    }
}
