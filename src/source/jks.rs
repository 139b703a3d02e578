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

//! Java KeyStore (JKS) container decoding.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic u32 (0xFEEDFEED) | version u32 (1 or 2) | count u32
//! count * entry
//! sha1(password as UTF-16BE || "Mighty Aphrodite" || everything above)
//! ```
//!
//! Each entry starts with a tag (1 = private key, 2 = trusted certificate), a
//! length-prefixed alias and a creation timestamp. Private keys carry the protected key
//! followed by their certificate chain, leaf first. Certificates are prefixed by their
//! type name ("X.509") in version 2 stores only.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use openssl::sha::Sha1;

use super::{Error, read_file};
use crate::expiry::CertificateRecord;

const MAGIC: u32 = 0xFEED_FEED;
const MAGIC_JCEKS: u32 = 0xCECE_CECE;
const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;
const DIGEST_LEN: usize = 20;
const WHITENER: &[u8] = b"Mighty Aphrodite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    PrivateKey {
        alias: String,
        /// DER certificates, leaf first.
        chain: Vec<Vec<u8>>,
    },
    TrustedCert {
        alias: String,
        cert: Vec<u8>,
    },
}

#[derive(Debug, Default)]
pub struct KeyStore {
    pub entries: Vec<Entry>,
}

impl KeyStore {
    /// Parses a keystore and checks its integrity digest against `passphrase`.
    pub fn parse(data: &[u8], passphrase: &str) -> Result<KeyStore, Error> {
        if data.len() < 12 + DIGEST_LEN {
            return Err(Error::Decode("keystore is truncated".to_string()));
        }
        let (body, digest) = data.split_at(data.len() - DIGEST_LEN);
        let store = Self::parse_body(body)?;
        if keyed_digest(passphrase, body) != digest {
            return Err(Error::Auth(
                "keystore password was incorrect or the keystore was tampered with".to_string(),
            ));
        }
        Ok(store)
    }

    fn parse_body(body: &[u8]) -> Result<KeyStore, Error> {
        let mut r = Reader(Cursor::new(body));
        match r.u32()? {
            MAGIC => {}
            MAGIC_JCEKS => return Err(Error::Decode("JCEKS keystores are not supported".to_string())),
            other => return Err(Error::Decode(format!("not a JKS keystore (magic {other:#010x})"))),
        }
        let version = r.u32()?;
        if version != 1 && version != 2 {
            return Err(Error::Decode(format!("unsupported keystore version {version}")));
        }
        let count = r.u32()?;

        let mut entries = Vec::new();
        for _ in 0..count {
            let tag = r.u32()?;
            let alias = r.utf()?;
            let _created_millis = r.u64()?;
            let entry = match tag {
                TAG_PRIVATE_KEY => {
                    let _protected_key = r.bytes()?;
                    let chain_len = r.u32()?;
                    let mut chain = Vec::new();
                    for _ in 0..chain_len {
                        chain.push(r.cert(version)?);
                    }
                    Entry::PrivateKey { alias, chain }
                }
                TAG_TRUSTED_CERT => Entry::TrustedCert {
                    cert: r.cert(version)?,
                    alias,
                },
                other => {
                    return Err(Error::Decode(format!(
                        "unsupported entry type {other} for alias {alias:?}"
                    )));
                }
            };
            entries.push(entry);
        }
        if r.remaining() != 0 {
            return Err(Error::Decode(format!(
                "{} trailing bytes after {count} entries",
                r.remaining()
            )));
        }
        Ok(KeyStore { entries })
    }

    /// Private key entries as (alias, chain). Trusted certificates are not included.
    pub fn private_keys(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.entries.iter().filter_map(|e| match e {
            Entry::PrivateKey { alias, chain } => Some((alias.as_str(), chain.as_slice())),
            Entry::TrustedCert { .. } => None,
        })
    }
}

/// Reads every private key entry of the keystore at `path`, yielding the leaf of each
/// chain keyed by the entry alias.
pub async fn decode(path: &str, passphrase: &str) -> Result<Vec<CertificateRecord>, Error> {
    let data = read_file(path).await?;
    let store = KeyStore::parse(&data, passphrase)?;
    store
        .private_keys()
        .map(|(alias, chain)| {
            let leaf = chain
                .first()
                .ok_or_else(|| Error::Decode(format!("entry {alias:?} has an empty chain")))?;
            CertificateRecord::from_der(alias, leaf)
        })
        .collect()
}

fn keyed_digest(passphrase: &str, body: &[u8]) -> [u8; DIGEST_LEN] {
    let mut h = Sha1::new();
    // Java chars, two bytes each
    for unit in passphrase.encode_utf16() {
        h.update(&unit.to_be_bytes());
    }
    h.update(WHITENER);
    h.update(body);
    h.finish()
}

struct Reader<'a>(Cursor<&'a [u8]>);

impl Reader<'_> {
    fn remaining(&self) -> usize {
        let len = self.0.get_ref().len() as u64;
        len.saturating_sub(self.0.position()) as usize
    }

    fn u32(&mut self) -> Result<u32, Error> {
        self.0.read_u32::<BigEndian>().map_err(truncated)
    }

    fn u64(&mut self) -> Result<u64, Error> {
        self.0.read_u64::<BigEndian>().map_err(truncated)
    }

    fn exact(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len > self.remaining() {
            return Err(truncated(()));
        }
        let mut buf = vec![0; len];
        self.0.read_exact(&mut buf).map_err(truncated)?;
        Ok(buf)
    }

    /// Java DataOutput.writeUTF: u16 length followed by modified UTF-8.
    fn utf(&mut self) -> Result<String, Error> {
        let len = self.0.read_u16::<BigEndian>().map_err(truncated)?;
        let raw = self.exact(len as usize)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u32()?;
        self.exact(len as usize)
    }

    fn cert(&mut self, version: u32) -> Result<Vec<u8>, Error> {
        if version == 2 {
            let cert_type = self.utf()?;
            if cert_type != "X.509" {
                return Err(Error::Decode(format!("unsupported certificate type {cert_type:?}")));
            }
        }
        self.bytes()
    }
}

fn truncated<E>(_: E) -> Error {
    Error::Decode("keystore is truncated".to_string())
}
