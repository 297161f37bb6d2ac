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

//! The state machine that accepts framed batches on an inbound connection
//! and writes them into channel segments. What to do with a header and with
//! a completed batch is up to an [`AppendPolicy`]: [`Spindle`] serves
//! producers on a primary, [`Mirror`] serves a primary's replication link.

mod mirror;
mod spindle;

use std::{
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use tracing::{debug, error, trace};

pub use self::{mirror::Mirror, spindle::Spindle};
use crate::{
    channel::{AppendSegment, EventChannel},
    error::{closed_by_peer, interrupted, would_block},
    frame::{BatchHeader, Frame, Handshake, ReadBuf, ReplicatedBatchHeader, BATCH_MAGIC},
    node::NodeId,
    reactor::{Handler, Select},
    Result,
};

const DEV_NULL_CHUNK: usize = 3 * 1024;

/// A frame that precedes a batch payload.
pub trait BatchFrame: Frame + Copy + fmt::Debug + Send {
    fn batch(&self) -> &BatchHeader;
}

impl BatchFrame for BatchHeader {
    fn batch(&self) -> &BatchHeader {
        self
    }
}

impl BatchFrame for ReplicatedBatchHeader {
    fn batch(&self) -> &BatchHeader {
        &self.header
    }
}

/// Where a resolved batch goes.
pub struct Target {
    pub channel: Arc<EventChannel>,
    pub append: AppendSegment,
}

/// The outcome of handing a completed batch over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handoff {
    Done,
    /// Downstream is full; the policy keeps the batch and is asked again.
    Retry,
}

pub trait AppendPolicy: Send {
    type Header: BatchFrame;

    /// The magic that opens the connection.
    const HANDSHAKE_MAGIC: i32;

    fn name(&self) -> &'static str;

    fn handshake(&mut self, peer: NodeId);

    /// Resolves the segment for a batch; `None` drains the payload.
    fn resolve(&mut self, header: &Self::Header) -> Option<Target>;

    /// The payload has been fully written into the target segment.
    fn complete(&mut self, header: &Self::Header, target: Target) -> Result<Handoff>;

    fn retry(&mut self) -> Result<Handoff> {
        Ok(Handoff::Done)
    }

    /// Writes any pending outbound frames. Returns true once drained.
    fn flush<W: Write>(&mut self, _socket: &mut W) -> Result<bool> {
        Ok(true)
    }

    fn has_pending_writes(&self) -> bool {
        false
    }

    fn closed(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppenderState {
    Handshake,
    Ready,
    ReadBatchHeader,
    Append,
    Commit,
    DevNull,
    Close,
}

pub struct Appender<P: AppendPolicy> {
    policy: P,
    state: AppenderState,
    handshake: ReadBuf,
    header_buf: ReadBuf,
    header: Option<P::Header>,
    target: Option<Target>,
    transferred: u64,
    drain_remaining: u64,
}

impl<P: AppendPolicy> Appender<P> {
    pub fn new(policy: P) -> Self {
        Appender {
            policy,
            state: AppenderState::Handshake,
            handshake: ReadBuf::new(Handshake::SIZE),
            header_buf: ReadBuf::new(P::Header::SIZE),
            header: None,
            target: None,
            transferred: 0,
            drain_remaining: 0,
        }
    }

    pub fn state(&self) -> AppenderState {
        self.state
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn interest(&self) -> Select {
        if self.state == AppenderState::Close {
            Select::Close
        } else if self.policy.has_pending_writes() {
            Select::ReadWrite
        } else {
            Select::Read
        }
    }

    fn fail(&mut self, err: crate::Error) -> Select {
        if err.is_closed() {
            debug!("{} connection closed: {}", self.policy.name(), err);
        } else {
            error!("{} connection in state {:?}: {}", self.policy.name(), self.state, err);
        }
        self.state = AppenderState::Close;
        Select::Close
    }

    fn read<S: Read>(&mut self, socket: &mut S) -> Result<Select> {
        loop {
            match self.state {
                AppenderState::Handshake => {
                    if !self.handshake.fill(socket)? {
                        return Ok(self.interest());
                    }
                    let handshake = Handshake::parse(self.handshake.bytes(), P::HANDSHAKE_MAGIC)?;
                    debug!("{} handshake from node {}", self.policy.name(), handshake.node);
                    self.policy.handshake(handshake.node);
                    self.state = AppenderState::Ready;
                }
                AppenderState::Ready => {
                    self.header_buf.clear();
                    self.state = AppenderState::ReadBatchHeader;
                }
                AppenderState::ReadBatchHeader => {
                    if !self.header_buf.fill(socket)? {
                        return Ok(self.interest());
                    }
                    let header = P::Header::parse(self.header_buf.bytes(), BATCH_MAGIC)?;
                    self.begin_append(header);
                }
                AppenderState::Append => {
                    if !self.transfer(socket)? {
                        // Retry once before going back to the reactor.
                        if !self.transfer(socket)? {
                            return Ok(self.interest());
                        }
                    }
                    let (header, target) = match (self.header, self.target.take()) {
                        (Some(header), Some(target)) => (header, target),
                        _ => {
                            self.state = AppenderState::Ready;
                            continue;
                        }
                    };
                    match self.policy.complete(&header, target)? {
                        Handoff::Done => self.state = AppenderState::Ready,
                        Handoff::Retry => {
                            self.state = AppenderState::Commit;
                            return Ok(self.interest());
                        }
                    }
                }
                AppenderState::Commit => match self.policy.retry()? {
                    Handoff::Done => self.state = AppenderState::Ready,
                    Handoff::Retry => return Ok(self.interest()),
                },
                AppenderState::DevNull => {
                    if !self.drain(socket)? {
                        return Ok(self.interest());
                    }
                    self.state = AppenderState::Ready;
                }
                AppenderState::Close => return Ok(Select::Close),
            }
        }
    }

    fn begin_append(&mut self, header: P::Header) {
        let batch_len = header.batch().batch_len as u64;
        self.header = Some(header);
        match self.policy.resolve(&header) {
            Some(target) => {
                trace!(
                    "{} append channel {} sequence {} at {}",
                    self.policy.name(),
                    header.batch().channel,
                    header.batch().sequence,
                    target.append.offset
                );
                self.target = Some(target);
                self.transferred = 0;
                self.state = AppenderState::Append;
            }
            None => {
                self.drain_remaining = batch_len;
                self.state = AppenderState::DevNull;
            }
        }
    }

    /// Returns true once the payload is fully in the segment.
    fn transfer<S: Read>(&mut self, socket: &mut S) -> Result<bool> {
        let (header, target) = match (&self.header, &self.target) {
            (Some(header), Some(target)) => (header, target),
            _ => return Ok(true),
        };
        let total = header.batch().batch_len as u64;
        if self.transferred < total {
            let position = target.append.position + self.transferred;
            self.transferred +=
                target
                    .append
                    .segment
                    .transfer_from(socket, position, total - self.transferred)?;
        }
        Ok(self.transferred == total)
    }

    /// Reads and discards the payload of a batch that is not written.
    fn drain<S: Read>(&mut self, socket: &mut S) -> Result<bool> {
        let mut chunk = [0u8; DEV_NULL_CHUNK];
        while self.drain_remaining > 0 {
            let want = self.drain_remaining.min(DEV_NULL_CHUNK as u64) as usize;
            match socket.read(&mut chunk[..want]) {
                Ok(0) => return Err(closed_by_peer().into()),
                Ok(n) => self.drain_remaining -= n as u64,
                Err(ref e) if would_block(e) => return Ok(false),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

impl<P: AppendPolicy, S: Read + Write> Handler<S> for Appender<P> {
    fn read_ready(&mut self, socket: &mut S) -> Select {
        match self.read(socket) {
            Ok(select) => select,
            Err(err) => self.fail(err),
        }
    }

    fn write_ready(&mut self, socket: &mut S) -> Select {
        if self.state == AppenderState::Close {
            return Select::Close;
        }
        match self.policy.flush(socket) {
            Ok(_) => self.interest(),
            Err(err) => self.fail(err),
        }
    }

    fn tick(&mut self, socket: &mut S) -> Option<Select> {
        if self.state != AppenderState::Commit {
            return None;
        }
        Some(self.read_ready(socket))
    }

    fn closed(&mut self) {
        self.state = AppenderState::Close;
        self.policy.closed();
    }
}
