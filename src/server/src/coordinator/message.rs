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

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    node::{ContactInformation, Node},
    Result,
};

/// Control messages exchanged between coordinators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Advertise { contact: ContactInformation },

    Open { channel: Uuid },
    Close { channel: Uuid },
    PrimaryOpened { channel: Uuid },
    MirrorOpened { channel: Uuid },
    PrimaryClosed { channel: Uuid },
    MirrorClosed { channel: Uuid },

    EstablishReplicators { members: BTreeSet<Node> },
    ReplicatorsEstablished,
    ReplicatorsFailed,
    Bootstrap { members: BTreeSet<Node> },
    BeginRebalance { members: BTreeSet<Node> },
    RebalanceComplete,
    RebalanceFailed,
}

/// How a received message travels on around the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routing {
    Handle,
    HandleThenForward,
    ForwardThenHandle,
}

impl Message {
    pub fn routing(&self) -> Routing {
        match self {
            Message::BeginRebalance { .. } => Routing::HandleThenForward,
            Message::EstablishReplicators { .. } => Routing::ForwardThenHandle,
            _ => Routing::Handle,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Advertise { .. } => "advertise",
            Message::Open { .. } => "open",
            Message::Close { .. } => "close",
            Message::PrimaryOpened { .. } => "primary_opened",
            Message::MirrorOpened { .. } => "mirror_opened",
            Message::PrimaryClosed { .. } => "primary_closed",
            Message::MirrorClosed { .. } => "mirror_closed",
            Message::EstablishReplicators { .. } => "establish_replicators",
            Message::ReplicatorsEstablished => "replicators_established",
            Message::ReplicatorsFailed => "replicators_failed",
            Message::Bootstrap { .. } => "bootstrap",
            Message::BeginRebalance { .. } => "begin_rebalance",
            Message::RebalanceComplete => "rebalance_complete",
            Message::RebalanceFailed => "rebalance_failed",
        }
    }
}

/// A message together with where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: Node,
    /// Milliseconds since the unix epoch, as stamped by the sender.
    pub time: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: Node, message: Message) -> Self {
        Envelope {
            sender,
            time: now_millis(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_per_kind() {
        let members = BTreeSet::from([Node::new(1, 1)]);
        assert_eq!(
            Message::BeginRebalance {
                members: members.clone()
            }
            .routing(),
            Routing::HandleThenForward
        );
        assert_eq!(
            Message::EstablishReplicators { members }.routing(),
            Routing::ForwardThenHandle
        );
        assert_eq!(Message::ReplicatorsEstablished.routing(), Routing::Handle);
        assert_eq!(
            Message::Open {
                channel: Uuid::new_v4()
            }
            .routing(),
            Routing::Handle
        );
    }

    #[test]
    fn envelope_wire_form() -> Result<()> {
        let channel = Uuid::new_v4();
        let envelope = Envelope::new(Node::new(3, 2), Message::MirrorOpened { channel });
        let bytes = envelope.encode()?;
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"type\":\"mirror_opened\""), "{}", text);
        assert_eq!(Envelope::decode(&bytes)?, envelope);
        Ok(())
    }
}
