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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, SourceConfig};

pub mod app;
pub mod helpers;

/// A configuration listening on an ephemeral localhost port, with periodic refresh disabled
/// so tests control when refreshes happen.
pub fn test_config(sources: Vec<SourceConfig>) -> config::Config {
    config::Config {
        listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        sources_path: PathBuf::from("test-sources.yaml"),
        sources,
        refresh_interval: Duration::ZERO,
        source_timeout: Duration::from_secs(5),
        termination_grace_period: Duration::from_secs(5),
    }
}
