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

mod lib;
#[cfg(any(test, feature = "testing"))]
pub mod mock;
mod probe;

pub use crate::tls::lib::*;
pub use crate::tls::probe::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("connect: {0}")]
    Connect(std::io::Error),

    #[error("tls handshake error: {0}")]
    Handshake(std::io::Error),

    #[error("peer presented no certificate")]
    NoPeerCertificate,
}
