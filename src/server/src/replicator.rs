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
    fmt,
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, TryRecvError},
        Arc,
    },
};

use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::{
    ack::Acknowledger,
    channel::{prefix_for, EventChannel},
    error::{interrupted, would_block},
    frame::{Handshake, ReplicatedBatchHeader, WriteBuf, REPLICATOR_MAGIC},
    node::NodeId,
    reactor::{Handler, Select},
    rendezvous::Rendezvous,
    segment::Segment,
    Result,
};

/// A batch appended on the primary, waiting to be streamed to the mirror.
pub struct ReplicationEvent {
    pub channel: Arc<EventChannel>,
    pub header: ReplicatedBatchHeader,
    pub acknowledger: Arc<dyn Acknowledger>,
}

impl fmt::Debug for ReplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEvent")
            .field("channel", &self.channel.id())
            .field("header", &self.header)
            .finish()
    }
}

/// Progress of a replication link as seen from outside the reactor.
#[derive(Debug, Default)]
pub struct LinkStatus {
    established: AtomicBool,
    closed: AtomicBool,
}

impl LinkStatus {
    /// The handshake went out and the link has not closed since.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicatorState {
    Handshake,
    Waiting,
    WriteHeader,
    WritePayload,
    Closed,
}

/// Streams batches from a primary to one mirror, in the order they were
/// handed off.
pub struct Replicator {
    node: NodeId,
    mirror: NodeId,
    state: ReplicatorState,
    events: Receiver<ReplicationEvent>,
    rendezvous: Option<Arc<Rendezvous>>,
    status: Arc<LinkStatus>,
    buf: WriteBuf,
    current: Option<ReplicationEvent>,
    written: u64,
    reader: Option<(Uuid, Segment)>,
}

impl Replicator {
    pub fn new(
        node: NodeId,
        mirror: NodeId,
        events: Receiver<ReplicationEvent>,
        rendezvous: Option<Arc<Rendezvous>>,
    ) -> Self {
        let mut buf = WriteBuf::new();
        buf.push(&Handshake {
            magic: REPLICATOR_MAGIC,
            node,
        });
        Replicator {
            node,
            mirror,
            state: ReplicatorState::Handshake,
            events,
            rendezvous,
            status: Arc::default(),
            buf,
            current: None,
            written: 0,
            reader: None,
        }
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        self.status.clone()
    }

    fn drive<S: Write>(&mut self, socket: &mut S) -> Select {
        match self.advance(socket) {
            Ok(select) => select,
            Err(err) => {
                if err.is_closed() {
                    debug!("replicator {} -> {} closed: {}", self.node, self.mirror, err);
                } else {
                    error!("replicator {} -> {}: {}", self.node, self.mirror, err);
                }
                self.state = ReplicatorState::Closed;
                Select::Close
            }
        }
    }

    fn advance<S: Write>(&mut self, socket: &mut S) -> Result<Select> {
        loop {
            match self.state {
                ReplicatorState::Handshake => {
                    if !self.buf.flush(socket)? {
                        return Ok(Select::Write);
                    }
                    debug!("replicator {} -> {} established", self.node, self.mirror);
                    self.state = ReplicatorState::Waiting;
                    self.status.established.store(true, Ordering::Release);
                    if let Some(rendezvous) = self.rendezvous.take() {
                        rendezvous.meet();
                    }
                }
                ReplicatorState::Waiting => match self.events.try_recv() {
                    Ok(event) => {
                        trace!(
                            "replicate channel {} sequence {} at {}",
                            event.header.header.channel,
                            event.header.header.sequence,
                            event.header.offset
                        );
                        self.buf.push(&event.header);
                        self.current = Some(event);
                        self.state = ReplicatorState::WriteHeader;
                    }
                    Err(TryRecvError::Empty) => return Ok(Select::Read),
                    Err(TryRecvError::Disconnected) => {
                        debug!("replicator {} -> {} released", self.node, self.mirror);
                        self.state = ReplicatorState::Closed;
                        return Ok(Select::Close);
                    }
                },
                ReplicatorState::WriteHeader => {
                    if !self.buf.flush(socket)? {
                        return Ok(Select::Write);
                    }
                    self.written = 0;
                    self.state = ReplicatorState::WritePayload;
                }
                ReplicatorState::WritePayload => {
                    if !self.write_payload(socket)? {
                        return Ok(Select::Write);
                    }
                    if let Some(event) = self.current.take() {
                        let header = &event.header;
                        event.channel.commit(header.offset);
                        event
                            .acknowledger
                            .acknowledge(header.header.channel, header.header.sequence);
                    }
                    self.state = ReplicatorState::Waiting;
                }
                ReplicatorState::Closed => return Ok(Select::Close),
            }
        }
    }

    /// Returns true once the whole payload of the current batch is written.
    fn write_payload<S: Write>(&mut self, socket: &mut S) -> Result<bool> {
        let event = match &self.current {
            Some(event) => event,
            None => return Ok(true),
        };
        let total = event.header.header.batch_len as u64;
        if self.written == total {
            return Ok(true);
        }
        let offset = event.header.offset;
        let prefix = prefix_for(offset, event.channel.max_segment_size());
        let channel_id = event.channel.id();
        let cached = match &self.reader {
            Some((id, segment)) => *id == channel_id && segment.prefix() == prefix,
            None => false,
        };
        if !cached {
            let segment = event.channel.open_read_segment(prefix)?;
            self.reader = Some((channel_id, segment));
        }
        if let Some((_, segment)) = &self.reader {
            let position = offset - prefix + self.written;
            self.written += segment.transfer_to(position, total - self.written, socket)?;
        }
        Ok(self.written == total)
    }

    fn interest(&self) -> Select {
        match self.state {
            ReplicatorState::Waiting => Select::Read,
            ReplicatorState::Closed => Select::Close,
            _ => Select::Write,
        }
    }
}

impl<S: Read + Write> Handler<S> for Replicator {
    fn connected(&mut self, socket: &mut S) -> Select {
        self.drive(socket)
    }

    /// Mirrors never talk back on a replication link; readability means
    /// the link went away.
    fn read_ready(&mut self, socket: &mut S) -> Select {
        let mut scratch = [0u8; 64];
        loop {
            match socket.read(&mut scratch) {
                Ok(0) => {
                    debug!("mirror {} closed replication link", self.mirror);
                    self.state = ReplicatorState::Closed;
                    return Select::Close;
                }
                Ok(n) => trace!("ignore {} unexpected bytes from mirror {}", n, self.mirror),
                Err(ref e) if would_block(e) => return self.interest(),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => {
                    debug!("replication link to {}: {}", self.mirror, e);
                    self.state = ReplicatorState::Closed;
                    return Select::Close;
                }
            }
        }
    }

    fn write_ready(&mut self, socket: &mut S) -> Select {
        self.drive(socket)
    }

    fn closed(&mut self) {
        self.state = ReplicatorState::Closed;
        self.status.closed.store(true, Ordering::Release);
        if let Some(rendezvous) = self.rendezvous.take() {
            rendezvous.cancel();
        }
    }
}

impl Drop for Replicator {
    // A handler can be dropped without ever being driven, for instance when
    // the reactor goes away before the connect completes.
    fn drop(&mut self) {
        self.status.closed.store(true, Ordering::Release);
    }
}
