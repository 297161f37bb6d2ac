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

use std::sync::Arc;

use tracing::{debug, warn};

use super::{AppendPolicy, Handoff, Target};
use crate::{
    channel::Role,
    frame::{ReplicatedBatchHeader, REPLICATOR_MAGIC},
    node::NodeId,
    weaver::Weaver,
    Result,
};

/// Accepts the replicated stream of a primary. Batches land at the offset
/// the primary assigned, are forced to disk, committed, and acknowledged
/// to their producer.
pub struct Mirror {
    weaver: Arc<Weaver>,
    primary: Option<NodeId>,
}

impl Mirror {
    pub fn new(weaver: Arc<Weaver>) -> Self {
        Mirror {
            weaver,
            primary: None,
        }
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.primary
    }
}

impl AppendPolicy for Mirror {
    type Header = ReplicatedBatchHeader;

    const HANDSHAKE_MAGIC: i32 = REPLICATOR_MAGIC;

    fn name(&self) -> &'static str {
        "mirror"
    }

    fn handshake(&mut self, peer: NodeId) {
        self.primary = Some(peer);
    }

    fn resolve(&mut self, replicated: &ReplicatedBatchHeader) -> Option<Target> {
        let header = &replicated.header;
        let channel = match self.weaver.event_channel(&header.channel) {
            Some(channel) if channel.role() == Role::Mirror => channel,
            Some(_) => {
                warn!(
                    "node {} is not mirror of channel {}, drop batch {} from {:?}",
                    self.weaver.id(),
                    header.channel,
                    header.sequence,
                    self.primary
                );
                return None;
            }
            None => {
                warn!(
                    "node {} is not hosting channel {}, drop batch {} from {:?}",
                    self.weaver.id(),
                    header.channel,
                    header.sequence,
                    self.primary
                );
                return None;
            }
        };
        if channel.is_duplicate(header) {
            debug!(
                "duplicate replicated batch {} of channel {}",
                header.sequence, header.channel
            );
            return None;
        }
        match channel.segment_for(replicated.offset, header.batch_len as u64) {
            Ok(append) => Some(Target { channel, append }),
            Err(err) => {
                warn!("channel {} replicated batch {}: {}", header.channel, header.sequence, err);
                None
            }
        }
    }

    fn complete(&mut self, replicated: &ReplicatedBatchHeader, target: Target) -> Result<Handoff> {
        let header = &replicated.header;
        target.channel.appended(header);
        target.append.segment.force()?;
        target.channel.commit(replicated.offset);
        match self.weaver.acknowledger(header.producer) {
            Some(acknowledger) => acknowledger.acknowledge(header.channel, header.sequence),
            None => warn!(
                "no acknowledger for producer {} of channel {} batch {}",
                header.producer, header.channel, header.sequence
            ),
        }
        Ok(Handoff::Done)
    }
}
