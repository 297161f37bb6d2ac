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

use std::{io::Write, sync::Arc};

use tracing::{debug, warn};

use super::{AppendPolicy, Handoff, Target};
use crate::{
    ack::{AckQueue, Acknowledger},
    channel::Role,
    frame::{BatchHeader, ReplicatedBatchHeader, WriteBuf, SPINDLE_MAGIC},
    node::NodeId,
    replicator::ReplicationEvent,
    weaver::{Replicate, Weaver},
    Result,
};

/// Accepts producer batches for channels this node is primary of, and
/// hands every appended batch to the replicator of the channel's mirror.
pub struct Spindle {
    weaver: Arc<Weaver>,
    acks: Arc<AckQueue>,
    producer: Option<NodeId>,
    pending: Option<ReplicationEvent>,
    out: WriteBuf,
}

impl Spindle {
    pub fn new(weaver: Arc<Weaver>, acks: Arc<AckQueue>) -> Self {
        Spindle {
            weaver,
            acks,
            producer: None,
            pending: None,
            out: WriteBuf::new(),
        }
    }

    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    fn hand_off(&mut self, event: ReplicationEvent) -> Handoff {
        let mirror = match event.channel.partner() {
            Some(mirror) => mirror,
            None => {
                commit_locally(event);
                return Handoff::Done;
            }
        };
        match self.weaver.replicate(mirror.id, event) {
            Replicate::Queued => Handoff::Done,
            Replicate::Full(event) => {
                self.pending = Some(event);
                Handoff::Retry
            }
            Replicate::NoLink(event) => {
                debug!(
                    "no replicator to {} for channel {}, commit locally",
                    mirror,
                    event.channel.id()
                );
                commit_locally(event);
                Handoff::Done
            }
        }
    }
}

fn commit_locally(event: ReplicationEvent) {
    let header = &event.header;
    event.channel.commit(header.offset);
    event
        .acknowledger
        .acknowledge(header.header.channel, header.header.sequence);
}

impl AppendPolicy for Spindle {
    type Header = BatchHeader;

    const HANDSHAKE_MAGIC: i32 = SPINDLE_MAGIC;

    fn name(&self) -> &'static str {
        "spindle"
    }

    fn handshake(&mut self, peer: NodeId) {
        self.producer = Some(peer);
        self.weaver.register_acknowledger(peer, self.acks.clone());
    }

    fn resolve(&mut self, header: &BatchHeader) -> Option<Target> {
        let channel = match self.weaver.event_channel(&header.channel) {
            Some(channel) => channel,
            None => {
                warn!(
                    "node {} is not hosting channel {}, drop batch {}",
                    self.weaver.id(),
                    header.channel,
                    header.sequence
                );
                return None;
            }
        };
        if channel.role() != Role::Primary {
            warn!(
                "node {} is not primary of channel {}, drop batch {}",
                self.weaver.id(),
                header.channel,
                header.sequence
            );
            return None;
        }
        if channel.is_duplicate(header) {
            debug!(
                "duplicate batch {} of channel {}",
                header.sequence, header.channel
            );
            return None;
        }
        match channel.append_segment_for(header) {
            Ok(append) => Some(Target { channel, append }),
            Err(err) => {
                warn!("channel {} batch {}: {}", header.channel, header.sequence, err);
                None
            }
        }
    }

    fn complete(&mut self, header: &BatchHeader, target: Target) -> Result<Handoff> {
        target.channel.appended(header);
        let event = ReplicationEvent {
            header: ReplicatedBatchHeader {
                header: *header,
                offset: target.append.offset,
            },
            channel: target.channel,
            acknowledger: self.acks.clone(),
        };
        Ok(self.hand_off(event))
    }

    fn retry(&mut self) -> Result<Handoff> {
        match self.pending.take() {
            Some(event) => Ok(self.hand_off(event)),
            None => Ok(Handoff::Done),
        }
    }

    fn flush<W: Write>(&mut self, socket: &mut W) -> Result<bool> {
        self.acks.drain_into(&mut self.out);
        Ok(self.out.flush(socket)?)
    }

    fn has_pending_writes(&self) -> bool {
        !self.out.is_empty() || !self.acks.is_empty()
    }

    fn closed(&mut self) {
        if let Some(producer) = self.producer.take() {
            let acks: Arc<dyn Acknowledger> = self.acks.clone();
            self.weaver.remove_acknowledger(producer, &acks);
        }
    }
}
