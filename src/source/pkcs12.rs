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

use once_cell::sync::Lazy;
use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::provider::Provider;
use tracing::warn;

use super::{Error, read_file};
use crate::expiry::CertificateRecord;

/// Reads the end-entity certificate of a PKCS#12 bundle. The alias is the file path.
pub async fn decode(path: &str, passphrase: &str) -> Result<Vec<CertificateRecord>, Error> {
    let data = read_file(path).await?;
    Ok(vec![parse(path, &data, passphrase)?])
}

// Bundles written by Java 8 keytool and OpenSSL 1.x encrypt with RC2-40, which OpenSSL 3 only
// offers through the legacy provider. Fallbacks are retained so the default provider stays active.
static LEGACY_PROVIDER: Lazy<Result<Provider, ErrorStack>> = Lazy::new(|| {
    Provider::try_load(None, "legacy", true).inspect_err(|e| {
        warn!("OpenSSL legacy provider unavailable, RC2/3DES bundles cannot be read: {e}")
    })
});

pub fn parse(alias: &str, data: &[u8], passphrase: &str) -> Result<CertificateRecord, Error> {
    Lazy::force(&LEGACY_PROVIDER);
    let bundle = Pkcs12::from_der(data)
        .map_err(|e| Error::Decode(format!("{alias}: not a PKCS#12 bundle: {e}")))?;
    let parsed = bundle.parse2(passphrase).map_err(|e| classify(alias, e))?;
    let cert = parsed
        .cert
        .ok_or_else(|| Error::Decode(format!("{alias}: bundle has no end-entity certificate")))?;
    let der = cert
        .to_der()
        .map_err(|e| Error::Decode(format!("{alias}: {e}")))?;
    CertificateRecord::from_der(alias, &der)
}

// OpenSSL reports a bad password as a MAC verification failure.
fn classify(alias: &str, e: ErrorStack) -> Error {
    let bad_mac = e
        .errors()
        .iter()
        .filter_map(|e| e.reason())
        .any(|reason| reason.contains("mac verify failure"));
    if bad_mac {
        return Error::Auth(format!("{alias}: incorrect password"));
    }
    match &*LEGACY_PROVIDER {
        Err(legacy) if is_unsupported_algorithm(&e) => Error::Decode(format!(
            "{alias}: bundle uses a legacy cipher and the OpenSSL legacy provider failed to load ({legacy}): {e}"
        )),
        _ => Error::Decode(format!("{alias}: {e}")),
    }
}

fn is_unsupported_algorithm(e: &ErrorStack) -> bool {
    e.errors()
        .iter()
        .filter_map(|e| e.reason())
        .any(|reason| reason.contains("unsupported"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::helpers;

    fn bundle() -> Vec<u8> {
        std::fs::read(helpers::testdata("bundle.p12")).unwrap()
    }

    #[tokio::test]
    async fn decode_bundle() {
        let path = helpers::testdata("bundle.p12");
        let records = decode(&path, "changeit").await.unwrap();
        assert_eq!(
            records,
            vec![CertificateRecord {
                alias: path,
                not_after: "20300101000000Z".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn decode_legacy_bundle() {
        // pbeWithSHA1And40BitRC2-CBC, as written by `openssl pkcs12 -export -legacy`
        let path = helpers::testdata("legacy.p12");
        let records = decode(&path, "changeit").await.unwrap();
        assert_eq!(
            records,
            vec![CertificateRecord {
                alias: path,
                not_after: "20300101000000Z".to_string(),
            }]
        );

        let legacy = std::fs::read(helpers::testdata("legacy.p12")).unwrap();
        assert!(matches!(
            parse("legacy", &legacy, "not-the-password"),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn wrong_password() {
        assert!(matches!(
            parse("bundle", &bundle(), "not-the-password"),
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn not_a_bundle() {
        assert!(matches!(
            parse("garbage", b"definitely not DER", "changeit"),
            Err(Error::Decode(_))
        ));
        let jks = std::fs::read(helpers::testdata("keystore.jks")).unwrap();
        assert!(matches!(parse("jks", &jks, "changeit"), Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn missing_file() {
        assert!(matches!(
            decode("/nonexistent/bundle.p12", "changeit").await,
            Err(Error::NotFound(_))
        ));
    }
}
