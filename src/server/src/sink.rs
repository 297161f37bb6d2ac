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
    io::{Read, Write},
    sync::Arc,
};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    channel::EventChannel,
    frame::{
        ChannelHeader, Frame, ReadBuf, SegmentHeader, WriteBuf, XeroxAck, XeroxHandshake,
        XEROX_MAGIC,
    },
    node::NodeId,
    reactor::{Handler, Select},
    segment::Segment,
    weaver::Weaver,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkState {
    Initial,
    ReadHandshake,
    ReadChannelHeader,
    ReadSegmentHeader,
    CopySegment,
    SendAck,
    /// Everything has been received; the ack waits for write readiness.
    Suspended,
    Finished,
    Closed,
}

/// Restores channels sent by a [`Xerox`](crate::xerox::Xerox).
///
/// The sink trusts the counts and sizes the sender declares. A short or
/// lying sender is only noticed through a later magic mismatch or a closed
/// connection.
pub struct Sink {
    weaver: Arc<Weaver>,
    state: SinkState,
    source: Option<NodeId>,
    handshake: ReadBuf,
    channel_header: ReadBuf,
    segment_header: ReadBuf,
    channel_count: u32,
    segment_count: u32,
    channel: Option<Arc<EventChannel>>,
    restored: Vec<Uuid>,
    segment: Option<(Segment, u64)>,
    copied: u64,
    out: WriteBuf,
}

impl Sink {
    pub fn new(weaver: Arc<Weaver>) -> Self {
        Sink {
            weaver,
            state: SinkState::Initial,
            source: None,
            handshake: ReadBuf::new(XeroxHandshake::SIZE),
            channel_header: ReadBuf::new(ChannelHeader::SIZE),
            segment_header: ReadBuf::new(SegmentHeader::SIZE),
            channel_count: 0,
            segment_count: 0,
            channel: None,
            restored: Vec::new(),
            segment: None,
            copied: 0,
            out: WriteBuf::new(),
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    fn drive<S: Read + Write>(&mut self, socket: &mut S) -> Select {
        match self.advance(socket) {
            Ok(select) => select,
            Err(err) => {
                if err.is_closed() {
                    debug!("sink from {:?} closed: {}", self.source, err);
                } else {
                    error!("sink from {:?} in state {:?}: {}", self.source, self.state, err);
                }
                self.state = SinkState::Closed;
                Select::Close
            }
        }
    }

    fn advance<S: Read + Write>(&mut self, socket: &mut S) -> Result<Select> {
        loop {
            match self.state {
                SinkState::Initial => self.state = SinkState::ReadHandshake,
                SinkState::ReadHandshake => {
                    if !self.handshake.fill(socket)? {
                        return Ok(Select::Read);
                    }
                    let handshake = XeroxHandshake::parse(self.handshake.bytes(), XEROX_MAGIC)?;
                    info!(
                        "node {} receives {} channels from {}",
                        self.weaver.id(),
                        handshake.channel_count,
                        handshake.source
                    );
                    self.source = Some(handshake.source);
                    self.channel_count = handshake.channel_count;
                    self.next_channel();
                }
                SinkState::ReadChannelHeader => {
                    if !self.channel_header.fill(socket)? {
                        return Ok(Select::Read);
                    }
                    let header = ChannelHeader::parse(self.channel_header.bytes(), XEROX_MAGIC)?;
                    debug!(
                        "sink channel {} with {} segments",
                        header.channel, header.segment_count
                    );
                    self.channel = Some(self.weaver.xerox_event_channel(header.channel)?);
                    self.restored.push(header.channel);
                    self.segment_count = header.segment_count;
                    self.next_segment();
                }
                SinkState::ReadSegmentHeader => {
                    if !self.segment_header.fill(socket)? {
                        return Ok(Select::Read);
                    }
                    let header = SegmentHeader::parse(self.segment_header.bytes(), XEROX_MAGIC)?;
                    let channel = match &self.channel {
                        Some(channel) => channel,
                        None => {
                            self.next_channel();
                            continue;
                        }
                    };
                    let segment = channel.sink_segment_for(header.prefix)?;
                    self.segment = Some((segment, header.size));
                    self.copied = 0;
                    self.state = SinkState::CopySegment;
                }
                SinkState::CopySegment => {
                    if let Some((segment, size)) = &self.segment {
                        if self.copied < *size {
                            self.copied +=
                                segment.transfer_from(socket, self.copied, size - self.copied)?;
                        }
                        if self.copied < *size {
                            return Ok(Select::Read);
                        }
                        segment.force()?;
                        if let Some(channel) = &self.channel {
                            channel.restored(segment.prefix(), *size);
                        }
                    }
                    self.segment = None;
                    self.next_segment();
                }
                SinkState::SendAck | SinkState::Suspended => {
                    if !self.out.flush(socket)? {
                        self.state = SinkState::Suspended;
                        return Ok(Select::Write);
                    }
                    info!("node {} finished sink from {:?}", self.weaver.id(), self.source);
                    self.state = SinkState::Finished;
                    for channel in std::mem::take(&mut self.restored) {
                        self.weaver.restored(channel);
                    }
                }
                SinkState::Finished | SinkState::Closed => return Ok(Select::Close),
            }
        }
    }

    fn next_channel(&mut self) {
        self.channel = None;
        if self.channel_count == 0 {
            self.out.push(&XeroxAck { magic: XEROX_MAGIC });
            self.state = SinkState::SendAck;
            return;
        }
        self.channel_count -= 1;
        self.channel_header.clear();
        self.state = SinkState::ReadChannelHeader;
    }

    fn next_segment(&mut self) {
        if self.segment_count == 0 {
            self.next_channel();
            return;
        }
        self.segment_count -= 1;
        self.segment_header.clear();
        self.state = SinkState::ReadSegmentHeader;
    }
}

impl<S: Read + Write> Handler<S> for Sink {
    fn accepted(&mut self, socket: &mut S) -> Select {
        self.drive(socket)
    }

    fn read_ready(&mut self, socket: &mut S) -> Select {
        match self.state {
            SinkState::SendAck | SinkState::Suspended => Select::Write,
            _ => self.drive(socket),
        }
    }

    fn write_ready(&mut self, socket: &mut S) -> Select {
        match self.state {
            SinkState::SendAck | SinkState::Suspended | SinkState::Finished | SinkState::Closed => {
                self.drive(socket)
            }
            _ => Select::Read,
        }
    }

    fn closed(&mut self) {
        if self.state != SinkState::Finished {
            self.state = SinkState::Closed;
        }
    }
}
