// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use spindle_server::{
    node::{ContactInformation, NodeId},
    Config, CoordinatorConfig, NodeConfig, PeerConfig, ReactorConfig, Server,
};
use tempdir::TempDir;
use tracing::info;
use uuid::Uuid;

use super::socket::next_n_avail_ports;

pub struct TestContext {
    name: String,
    root_dir: TempDir,
    handles: Vec<thread::JoinHandle<()>>,
}

impl TestContext {
    pub fn new(prefix: &str) -> Self {
        let root_dir = TempDir::new(prefix).unwrap();
        TestContext {
            name: prefix.to_owned(),
            root_dir,
            handles: Vec::default(),
        }
    }

    /// Configs for a cluster of `ids`, every node listing the others as
    /// peers and opening `channels` once started.
    pub fn cluster(&self, ids: &[NodeId], channels: &[Uuid]) -> Vec<Config> {
        let ports = next_n_avail_ports(3 * ids.len());
        let addr = |port: u16| -> SocketAddr { format!("127.0.0.1:{}", port).parse().unwrap() };
        let contacts: Vec<ContactInformation> = ports
            .chunks(3)
            .map(|ports| ContactInformation {
                spindle: addr(ports[0]),
                replicator: addr(ports[1]),
                xerox: addr(ports[2]),
            })
            .collect();
        ids.iter()
            .zip(&contacts)
            .map(|(id, contact)| Config {
                root_dir: self.root_dir.path().join(format!("node-{}", id)),
                spindle_addr: contact.spindle.to_string(),
                replication_addr: contact.replicator.to_string(),
                xerox_addr: contact.xerox.to_string(),
                node: NodeConfig {
                    id: *id,
                    capacity: 1,
                },
                coordinator: CoordinatorConfig {
                    rendezvous_timeout_ms: 10_000,
                },
                reactor: ReactorConfig {
                    tick_interval_ms: 20,
                    ..Default::default()
                },
                peers: ids
                    .iter()
                    .zip(&contacts)
                    .filter(|(peer, _)| *peer != id)
                    .map(|(peer, contact)| PeerConfig {
                        id: *peer,
                        capacity: 1,
                        contact: *contact,
                    })
                    .collect(),
                channels: channels.to_vec(),
                ..Default::default()
            })
            .collect()
    }

    pub fn spawn_server(&mut self, server: Server) {
        let name = format!("{}-node-{}", self.name, server.weaver().id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || server.run().unwrap())
            .unwrap();
        self.handles.push(handle);
    }

    /// Waits for every spawned server, which must have been told to stop.
    pub fn shutdown(&mut self) {
        info!("{} shutdown cluster ...", self.name);
        for handle in std::mem::take(&mut self.handles) {
            handle.join().unwrap_or_default();
        }
        info!("{} shutdown cluster success", self.name);
    }
}

/// Polls `cond` until it holds, panicking after a while.
pub fn wait_for<F>(what: &str, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}
