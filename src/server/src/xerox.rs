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
    collections::VecDeque,
    io::{Read, Write},
    sync::Arc,
};

use tracing::{debug, error, info, trace};

use crate::{
    channel::EventChannel,
    frame::{
        ChannelHeader, Frame, ReadBuf, SegmentHeader, WriteBuf, XeroxAck, XeroxHandshake,
        XEROX_MAGIC,
    },
    node::NodeId,
    reactor::{Handler, Select},
    rendezvous::Rendezvous,
    segment::Segment,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XeroxState {
    WriteHandshake,
    WriteChannelHeader,
    WriteSegmentHeader,
    CopySegment,
    ReadAck,
    Finished,
    Closed,
}

struct Copying {
    segment: Segment,
    size: u64,
    written: u64,
}

/// Sends whole channels, segment by segment, to a node that is taking them
/// over. Meets its rendezvous once the receiver acknowledges everything.
pub struct Xerox {
    node: NodeId,
    target: NodeId,
    state: XeroxState,
    channels: VecDeque<Arc<EventChannel>>,
    channel: Option<Arc<EventChannel>>,
    segments: VecDeque<u64>,
    copying: Option<Copying>,
    buf: WriteBuf,
    ack: ReadBuf,
    rendezvous: Option<Arc<Rendezvous>>,
}

impl Xerox {
    pub fn new(
        node: NodeId,
        target: NodeId,
        channels: Vec<Arc<EventChannel>>,
        rendezvous: Arc<Rendezvous>,
    ) -> Result<Self> {
        let channel_count = u32::try_from(channels.len())
            .map_err(|_| Error::InvalidArgument("too many channels".to_owned()))?;
        let mut buf = WriteBuf::new();
        buf.push(&XeroxHandshake {
            magic: XEROX_MAGIC,
            source: node,
            channel_count,
        });
        Ok(Xerox {
            node,
            target,
            state: XeroxState::WriteHandshake,
            channels: channels.into(),
            channel: None,
            segments: VecDeque::new(),
            copying: None,
            buf,
            ack: ReadBuf::new(XeroxAck::SIZE),
            rendezvous: Some(rendezvous),
        })
    }

    pub fn state(&self) -> XeroxState {
        self.state
    }

    fn drive<S: Read + Write>(&mut self, socket: &mut S) -> Select {
        match self.advance(socket) {
            Ok(select) => select,
            Err(err) => {
                if err.is_closed() {
                    debug!("xerox {} -> {} closed: {}", self.node, self.target, err);
                } else {
                    error!(
                        "xerox {} -> {} in state {:?}: {}",
                        self.node, self.target, self.state, err
                    );
                }
                self.abandon();
                Select::Close
            }
        }
    }

    fn advance<S: Read + Write>(&mut self, socket: &mut S) -> Result<Select> {
        loop {
            match self.state {
                XeroxState::WriteHandshake => {
                    if !self.buf.flush(socket)? {
                        return Ok(Select::Write);
                    }
                    self.next_channel()?;
                }
                XeroxState::WriteChannelHeader => {
                    if !self.buf.flush(socket)? {
                        return Ok(Select::Write);
                    }
                    self.next_segment()?;
                }
                XeroxState::WriteSegmentHeader => {
                    if !self.buf.flush(socket)? {
                        return Ok(Select::Write);
                    }
                    self.state = XeroxState::CopySegment;
                }
                XeroxState::CopySegment => {
                    if let Some(copying) = &mut self.copying {
                        if copying.written < copying.size {
                            copying.written += copying.segment.transfer_to(
                                copying.written,
                                copying.size - copying.written,
                                socket,
                            )?;
                        }
                        if copying.written < copying.size {
                            return Ok(Select::Write);
                        }
                        trace!(
                            "xerox {} -> {} copied segment {:x}",
                            self.node,
                            self.target,
                            copying.segment.prefix()
                        );
                    }
                    self.copying = None;
                    self.next_segment()?;
                }
                XeroxState::ReadAck => {
                    if !self.ack.fill(socket)? {
                        return Ok(Select::Read);
                    }
                    XeroxAck::parse(self.ack.bytes(), XEROX_MAGIC)?;
                    info!("xerox {} -> {} finished", self.node, self.target);
                    self.state = XeroxState::Finished;
                    if let Some(rendezvous) = self.rendezvous.take() {
                        rendezvous.meet();
                    }
                }
                XeroxState::Finished | XeroxState::Closed => return Ok(Select::Close),
            }
        }
    }

    fn next_channel(&mut self) -> Result<()> {
        self.channel = None;
        let channel = match self.channels.pop_front() {
            Some(channel) => channel,
            None => {
                self.state = XeroxState::ReadAck;
                return Ok(());
            }
        };
        let segments = channel.segments()?;
        let segment_count = u32::try_from(segments.len())
            .map_err(|_| Error::InvalidArgument("too many segments".to_owned()))?;
        debug!(
            "xerox {} -> {} channel {} with {} segments",
            self.node,
            self.target,
            channel.id(),
            segment_count
        );
        self.buf.push(&ChannelHeader {
            magic: XEROX_MAGIC,
            segment_count,
            channel: channel.id(),
        });
        self.segments = segments.into();
        self.channel = Some(channel);
        self.state = XeroxState::WriteChannelHeader;
        Ok(())
    }

    fn next_segment(&mut self) -> Result<()> {
        let prefix = match self.segments.pop_front() {
            Some(prefix) => prefix,
            None => return self.next_channel(),
        };
        let channel = match &self.channel {
            Some(channel) => channel,
            None => return self.next_channel(),
        };
        let segment = channel.open_read_segment(prefix)?;
        let size = segment.size()?;
        self.buf.push(&SegmentHeader {
            magic: XEROX_MAGIC,
            prefix,
            size,
        });
        self.copying = Some(Copying {
            segment,
            size,
            written: 0,
        });
        self.state = XeroxState::WriteSegmentHeader;
        Ok(())
    }

    fn abandon(&mut self) {
        if self.state != XeroxState::Finished {
            self.state = XeroxState::Closed;
            if let Some(rendezvous) = self.rendezvous.take() {
                rendezvous.cancel();
            }
        }
    }
}

impl<S: Read + Write> Handler<S> for Xerox {
    fn connected(&mut self, socket: &mut S) -> Select {
        self.drive(socket)
    }

    fn read_ready(&mut self, socket: &mut S) -> Select {
        match self.state {
            XeroxState::ReadAck => self.drive(socket),
            XeroxState::Finished | XeroxState::Closed => Select::Close,
            _ => Select::Write,
        }
    }

    fn write_ready(&mut self, socket: &mut S) -> Select {
        match self.state {
            XeroxState::ReadAck => Select::Read,
            _ => self.drive(socket),
        }
    }

    fn closed(&mut self) {
        self.abandon();
    }
}
