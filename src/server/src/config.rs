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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    node::{ContactInformation, Node, NodeId},
    Result,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The root dir of the channel buffer; every channel owns a sub dir.
    pub root_dir: PathBuf,

    /// Producers connect here.
    pub spindle_addr: String,

    /// Primaries replicate batches here.
    pub replication_addr: String,

    /// Bulk channel transfers arrive here.
    pub xerox_addr: String,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub reactor: ReactorConfig,

    /// The other members of the cluster.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Channels opened once the node is stable.
    #[serde(default)]
    pub channels: Vec<Uuid>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: NodeId,

    /// The number of positions this node claims on the hash ring.
    ///
    /// DEFAULT: 1
    pub capacity: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// DEFAULT: 64MB
    pub max_segment_size: u64,

    /// The number of recently appended batches remembered per channel to
    /// suppress duplicates.
    ///
    /// DEFAULT: 1024
    pub dedup_capacity: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long replicator and rebalance rendezvous wait for all parties.
    ///
    /// DEFAULT: 60000
    pub rendezvous_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// The number of committed batches buffered per replication link before
    /// appenders are pushed back.
    ///
    /// DEFAULT: 1024
    pub queue_capacity: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// DEFAULT: 500
    pub tick_interval_ms: u64,

    /// DEFAULT: 1024
    pub max_events: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub capacity: u32,
    pub contact: ContactInformation,
}

impl Config {
    pub fn local_node(&self) -> Node {
        Node::new(self.node.id, self.node.capacity)
    }

    pub fn contact(&self) -> Result<ContactInformation> {
        Ok(ContactInformation {
            spindle: self.spindle_addr.parse()?,
            replicator: self.replication_addr.parse()?,
            xerox: self.xerox_addr.parse()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root_dir: PathBuf::from("./spindle"),
            spindle_addr: "127.0.0.1:21801".to_owned(),
            replication_addr: "127.0.0.1:21802".to_owned(),
            xerox_addr: "127.0.0.1:21803".to_owned(),
            node: NodeConfig::default(),
            channel: ChannelConfig::default(),
            coordinator: CoordinatorConfig::default(),
            replication: ReplicationConfig::default(),
            reactor: ReactorConfig::default(),
            peers: Vec::default(),
            channels: Vec::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig { id: 0, capacity: 1 }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            max_segment_size: 64 << 20,
            dedup_capacity: 1024,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            rendezvous_timeout_ms: 60_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            queue_capacity: 1024,
        }
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            tick_interval_ms: 500,
            max_events: 1024,
        }
    }
}

impl ReactorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_takes_defaults() {
        let json = r#"{
            "root_dir": "/tmp/spindle",
            "spindle_addr": "127.0.0.1:1",
            "replication_addr": "127.0.0.1:2",
            "xerox_addr": "127.0.0.1:3",
            "node": { "id": 7, "capacity": 3 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.local_node().id, 7);
        assert_eq!(config.node.capacity, 3);
        assert_eq!(config.channel.max_segment_size, 64 << 20);
        assert_eq!(
            config.coordinator.rendezvous_timeout(),
            Duration::from_secs(60)
        );
        let contact = config.contact().unwrap();
        assert_eq!(contact.xerox.port(), 3);
    }
}
