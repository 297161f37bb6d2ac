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

//! Fixed size frames exchanged on the wire, and the buffers used to move them
//! across non-blocking sockets. All integers are big endian.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::{
    error::{closed_by_peer, interrupted, would_block},
    node::NodeId,
    Error, Result,
};

pub const BATCH_MAGIC: i32 = 0x0b47_c401;
pub const SPINDLE_MAGIC: i32 = 0x5b1d_0e01;
pub const REPLICATOR_MAGIC: i32 = 0x5b1d_0e02;
pub const XEROX_MAGIC: i32 = 0x5b1d_0e03;
pub const ACK_MAGIC: i32 = 0x5b1d_0e04;

pub trait Frame: Sized {
    const SIZE: usize;

    fn magic(&self) -> i32;

    fn encode(&self, buf: &mut impl BufMut);

    fn decode(buf: &mut impl Buf) -> Self;

    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.encode(&mut buf);
        buf
    }

    /// Decodes a frame and verifies that it carries `expected` as magic.
    fn parse(mut bytes: &[u8], expected: i32) -> Result<Self> {
        let frame = Self::decode(&mut bytes);
        if frame.magic() != expected {
            return Err(Error::InvalidMagic {
                expected,
                actual: frame.magic(),
            });
        }
        Ok(frame)
    }
}

/// The key used to recognize a batch that has already been appended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchIdentity {
    pub channel: Uuid,
    pub sequence: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchHeader {
    pub magic: i32,
    /// The node that produced the batch; acknowledgements are routed to it.
    pub producer: NodeId,
    pub batch_len: u32,
    pub channel: Uuid,
    pub sequence: i64,
}

impl BatchHeader {
    pub fn new(producer: NodeId, channel: Uuid, sequence: i64, batch_len: u32) -> Self {
        BatchHeader {
            magic: BATCH_MAGIC,
            producer,
            batch_len,
            channel,
            sequence,
        }
    }

    pub fn identity(&self) -> BatchIdentity {
        BatchIdentity {
            channel: self.channel,
            sequence: self.sequence,
        }
    }
}

impl Frame for BatchHeader {
    const SIZE: usize = 36;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_u32(self.producer);
        buf.put_u32(self.batch_len);
        buf.put_u128(self.channel.as_u128());
        buf.put_i64(self.sequence);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        BatchHeader {
            magic: buf.get_i32(),
            producer: buf.get_u32(),
            batch_len: buf.get_u32(),
            channel: Uuid::from_u128(buf.get_u128()),
            sequence: buf.get_i64(),
        }
    }
}

/// A batch header stamped by the primary with the offset the mirror must
/// place the batch at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicatedBatchHeader {
    pub header: BatchHeader,
    pub offset: u64,
}

impl Frame for ReplicatedBatchHeader {
    const SIZE: usize = BatchHeader::SIZE + 8;

    fn magic(&self) -> i32 {
        self.header.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        self.header.encode(buf);
        buf.put_u64(self.offset);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let header = BatchHeader::decode(buf);
        ReplicatedBatchHeader {
            header,
            offset: buf.get_u64(),
        }
    }
}

/// Opens spindle and replication connections: `{magic, node}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub magic: i32,
    pub node: NodeId,
}

impl Frame for Handshake {
    const SIZE: usize = 8;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_u32(self.node);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Handshake {
            magic: buf.get_i32(),
            node: buf.get_u32(),
        }
    }
}

/// Acknowledges a batch back to its producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckFrame {
    pub channel: Uuid,
    pub sequence: i64,
}

impl Frame for AckFrame {
    const SIZE: usize = 28;

    fn magic(&self) -> i32 {
        ACK_MAGIC
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(ACK_MAGIC);
        buf.put_u128(self.channel.as_u128());
        buf.put_i64(self.sequence);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let _magic = buf.get_i32();
        AckFrame {
            channel: Uuid::from_u128(buf.get_u128()),
            sequence: buf.get_i64(),
        }
    }

    fn parse(mut bytes: &[u8], expected: i32) -> Result<Self> {
        let actual = (&bytes[..4]).get_i32();
        if actual != expected {
            return Err(Error::InvalidMagic { expected, actual });
        }
        Ok(Self::decode(&mut bytes))
    }
}

/// Opens a bulk transfer: `{magic, source node, channel count}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XeroxHandshake {
    pub magic: i32,
    pub source: NodeId,
    pub channel_count: u32,
}

impl Frame for XeroxHandshake {
    const SIZE: usize = 12;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_u32(self.source);
        buf.put_u32(self.channel_count);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        XeroxHandshake {
            magic: buf.get_i32(),
            source: buf.get_u32(),
            channel_count: buf.get_u32(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelHeader {
    pub magic: i32,
    pub segment_count: u32,
    pub channel: Uuid,
}

impl Frame for ChannelHeader {
    const SIZE: usize = 24;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_u32(self.segment_count);
        buf.put_u128(self.channel.as_u128());
    }

    fn decode(buf: &mut impl Buf) -> Self {
        ChannelHeader {
            magic: buf.get_i32(),
            segment_count: buf.get_u32(),
            channel: Uuid::from_u128(buf.get_u128()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: i32,
    pub prefix: u64,
    pub size: u64,
}

impl Frame for SegmentHeader {
    const SIZE: usize = 20;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
        buf.put_u64(self.prefix);
        buf.put_u64(self.size);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        SegmentHeader {
            magic: buf.get_i32(),
            prefix: buf.get_u64(),
            size: buf.get_u64(),
        }
    }
}

/// Closes a bulk transfer once the receiver has restored every segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XeroxAck {
    pub magic: i32,
}

impl Frame for XeroxAck {
    const SIZE: usize = 4;

    fn magic(&self) -> i32 {
        self.magic
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.magic);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        XeroxAck {
            magic: buf.get_i32(),
        }
    }
}

/// Accumulates a fixed size frame across partial reads.
pub struct ReadBuf {
    buf: BytesMut,
    filled: usize,
}

impl ReadBuf {
    pub fn new(size: usize) -> ReadBuf {
        let mut buf = BytesMut::with_capacity(size);
        buf.resize(size, 0);
        ReadBuf { buf, filled: 0 }
    }

    /// Reads until the frame is complete or the source would block. Returns
    /// whether the frame is complete. A source at EOF is reported as a
    /// `UnexpectedEof` error.
    pub fn fill<R: Read>(&mut self, src: &mut R) -> io::Result<bool> {
        while self.filled < self.buf.len() {
            match src.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Err(closed_by_peer()),
                Ok(n) => self.filled += n,
                Err(ref e) if would_block(e) => return Ok(false),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

/// Bytes waiting to be written to a non-blocking socket.
#[derive(Default)]
pub struct WriteBuf {
    buf: BytesMut,
    written: usize,
}

impl WriteBuf {
    pub fn new() -> WriteBuf {
        WriteBuf {
            buf: BytesMut::with_capacity(4 * 1024),
            written: 0,
        }
    }

    pub fn push<F: Frame>(&mut self, frame: &F) {
        frame.encode(&mut self.buf);
    }

    pub fn consume(&mut self, size: usize) {
        self.written += size;
        if self.written == self.buf.len() {
            self.buf.clear();
            self.written = 0;
        }
    }

    /// Writes until drained or the sink would block. Returns whether the
    /// buffer has been drained.
    pub fn flush<W: Write>(&mut self, dst: &mut W) -> io::Result<bool> {
        while !self.is_empty() {
            match dst.write(&self.buf[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.consume(n),
                Err(ref e) if would_block(e) => return Ok(false),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.written
    }
}
