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

mod helper;

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    time::Duration,
};

use spindle_server::{
    ack::AckQueue,
    appender::{Appender, AppenderState, Spindle},
    frame::{
        AckFrame, BatchHeader, Frame, Handshake, ReplicatedBatchHeader, ACK_MAGIC, BATCH_MAGIC,
        REPLICATOR_MAGIC, SPINDLE_MAGIC,
    },
    node::Node,
    reactor::{BoxHandler, Connector, Handler, NoopWakeup, Select, Socket, Wakeup},
    weaver::Weaver,
    Config, NodeConfig,
};
use tempdir::TempDir;
use uuid::Uuid;

use crate::helper::pipe::{pipe, Endpoint};

#[ctor::ctor]
fn init() {
    tracing_subscriber::fmt::init();
}

/// Accepts every connection and never drives it.
struct Parked;

impl Connector for Parked {
    fn connect(
        &self,
        _addr: SocketAddr,
        _handler: BoxHandler,
    ) -> spindle_server::Result<Arc<dyn Wakeup>> {
        Ok(Arc::new(NoopWakeup))
    }
}

/// Keeps every outbound handler for the test to drive by hand.
#[derive(Default)]
struct Held {
    handlers: Mutex<Vec<BoxHandler>>,
}

impl Connector for Held {
    fn connect(
        &self,
        _addr: SocketAddr,
        handler: BoxHandler,
    ) -> spindle_server::Result<Arc<dyn Wakeup>> {
        self.handlers.lock().unwrap().push(handler);
        Ok(Arc::new(NoopWakeup))
    }
}

struct Fixture {
    _dir: TempDir,
    weaver: Arc<Weaver>,
    producer: Endpoint,
    socket: Endpoint,
    appender: Appender<Spindle>,
}

fn fixture(prefix: &str) -> Fixture {
    let dir = TempDir::new(prefix).unwrap();
    let config = Config {
        root_dir: dir.path().to_owned(),
        node: NodeConfig { id: 1, capacity: 1 },
        ..Default::default()
    };
    let weaver = Arc::new(Weaver::new(&config, Arc::new(Parked)).unwrap());
    let (producer, socket) = pipe(64 * 1024);
    let acks = Arc::new(AckQueue::new(Arc::new(NoopWakeup)));
    let appender = Appender::new(Spindle::new(weaver.clone(), acks));
    Fixture {
        _dir: dir,
        weaver,
        producer,
        // Small reads exercise every partial frame path.
        socket: socket.with_chunk(7),
        appender,
    }
}

fn handshake(producer: &mut Endpoint, magic: i32) {
    let handshake = Handshake { magic, node: 7 };
    producer.write_all(&handshake.to_bytes()).unwrap();
}

fn batch(producer: &mut Endpoint, channel: Uuid, sequence: i64, payload: &[u8]) {
    let header = BatchHeader::new(7, channel, sequence, payload.len() as u32);
    producer.write_all(&header.to_bytes()).unwrap();
    producer.write_all(payload).unwrap();
}

fn acks(producer: &mut Endpoint) -> Vec<AckFrame> {
    let mut acks = Vec::new();
    while producer.pending() >= AckFrame::SIZE {
        let mut buf = [0u8; AckFrame::SIZE];
        producer.read_exact(&mut buf).unwrap();
        acks.push(AckFrame::parse(&buf, ACK_MAGIC).unwrap());
    }
    acks
}

#[test]
fn append_and_acknowledge() {
    let mut f = fixture("append_and_acknowledge");
    let channel = Uuid::new_v4();
    f.weaver.open_primary(channel, None).unwrap();

    handshake(&mut f.producer, SPINDLE_MAGIC);
    batch(&mut f.producer, channel, 1, b"hello");
    let select = f.appender.read_ready(&mut f.socket);
    assert_eq!(select, Select::ReadWrite);
    assert_eq!(f.appender.policy().producer(), Some(7));

    assert_eq!(f.appender.write_ready(&mut f.socket), Select::Read);
    let acks = acks(&mut f.producer);
    assert_eq!(acks, vec![AckFrame { channel, sequence: 1 }]);

    let event_channel = f.weaver.event_channel(&channel).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(event_channel.read_at(0, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(event_channel.next_offset(), 5);
}

#[test]
fn duplicate_batch_is_drained() {
    let mut f = fixture("duplicate_batch_is_drained");
    let channel = Uuid::new_v4();
    f.weaver.open_primary(channel, None).unwrap();

    handshake(&mut f.producer, SPINDLE_MAGIC);
    batch(&mut f.producer, channel, 1, b"hello");
    batch(&mut f.producer, channel, 1, b"hello");
    batch(&mut f.producer, channel, 2, b"world");
    f.appender.read_ready(&mut f.socket);
    f.appender.write_ready(&mut f.socket);

    // Both copies are consumed from the connection, one is written.
    assert_eq!(f.socket.pending(), 0);
    assert_eq!(f.appender.state(), AppenderState::ReadBatchHeader);
    let sequences: Vec<i64> = acks(&mut f.producer).iter().map(|a| a.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);

    let event_channel = f.weaver.event_channel(&channel).unwrap();
    assert_eq!(event_channel.next_offset(), 10);
    let mut buf = [0u8; 10];
    event_channel.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"helloworld");
}

#[test]
fn unknown_channel_keeps_framing() {
    let mut f = fixture("unknown_channel_keeps_framing");
    let known = Uuid::new_v4();
    f.weaver.open_primary(known, None).unwrap();

    handshake(&mut f.producer, SPINDLE_MAGIC);
    batch(&mut f.producer, Uuid::new_v4(), 1, &[0xab; 5000]);
    batch(&mut f.producer, known, 1, b"after");
    f.appender.read_ready(&mut f.socket);
    f.appender.write_ready(&mut f.socket);

    assert_eq!(acks(&mut f.producer).len(), 1);
    let mut buf = [0u8; 5];
    f.weaver
        .event_channel(&known)
        .unwrap()
        .read_at(0, &mut buf)
        .unwrap();
    assert_eq!(&buf, b"after");
}

#[test]
fn mirror_channel_rejects_producer_batches() {
    let mut f = fixture("mirror_channel_rejects_producer_batches");
    let channel = Uuid::new_v4();
    f.weaver.open_mirror(channel, None).unwrap();

    handshake(&mut f.producer, SPINDLE_MAGIC);
    batch(&mut f.producer, channel, 1, b"hello");
    assert_eq!(f.appender.read_ready(&mut f.socket), Select::Read);
    assert!(acks(&mut f.producer).is_empty());
    assert_eq!(f.weaver.event_channel(&channel).unwrap().next_offset(), 0);
}

#[test]
fn bad_magic_closes() {
    let mut f = fixture("bad_magic_closes");
    handshake(&mut f.producer, 0x0bad_0bad);
    assert_eq!(f.appender.read_ready(&mut f.socket), Select::Close);
    assert_eq!(f.appender.state(), AppenderState::Close);

    let mut f = fixture("bad_batch_magic_closes");
    let channel = Uuid::new_v4();
    f.weaver.open_primary(channel, None).unwrap();
    handshake(&mut f.producer, SPINDLE_MAGIC);
    let mut header = BatchHeader::new(7, channel, 1, 5);
    header.magic = 0x0bad_0bad;
    f.producer.write_all(&header.to_bytes()).unwrap();
    assert_eq!(f.appender.read_ready(&mut f.socket), Select::Close);
}

#[test]
fn peer_close_mid_batch() {
    let mut f = fixture("peer_close_mid_batch");
    let channel = Uuid::new_v4();
    f.weaver.open_primary(channel, None).unwrap();

    handshake(&mut f.producer, SPINDLE_MAGIC);
    let header = BatchHeader::new(7, channel, 1, 10);
    f.producer.write_all(&header.to_bytes()).unwrap();
    f.producer.write_all(b"half").unwrap();
    assert_eq!(f.appender.read_ready(&mut f.socket), Select::Read);
    assert_eq!(f.appender.state(), AppenderState::Append);

    f.producer.close();
    assert_eq!(f.appender.read_ready(&mut f.socket), Select::Close);
    Handler::<Endpoint>::closed(&mut f.appender);
    assert_eq!(f.appender.state(), AppenderState::Close);
}

/// A connected non-blocking socket for a replicator, and the mirror's end.
fn replication_link() -> (Socket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mirror, _) = listener.accept().unwrap();
    stream.set_nonblocking(true).unwrap();
    mirror
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    (Socket::from_std(stream), mirror)
}

#[test]
fn full_replication_queue_parks_appender() {
    let dir = TempDir::new("full_replication_queue_parks_appender").unwrap();
    let mut config = Config {
        root_dir: dir.path().to_owned(),
        node: NodeConfig { id: 1, capacity: 1 },
        ..Default::default()
    };
    config.replication.queue_capacity = 1;
    let held = Arc::new(Held::default());
    let weaver = Arc::new(Weaver::new(&config, held.clone()).unwrap());
    let mirror = Node::new(2, 1);
    weaver.add_contact(mirror.id, Config::default().contact().unwrap());
    weaver.open_replicator(mirror, None).unwrap();
    let mut replicator = held.handlers.lock().unwrap().pop().unwrap();

    let channel = Uuid::new_v4();
    weaver.open_primary(channel, Some(mirror)).unwrap();
    let (mut producer, socket) = pipe(64 * 1024);
    let mut socket = socket.with_chunk(7);
    let queue = Arc::new(AckQueue::new(Arc::new(NoopWakeup)));
    let mut appender = Appender::new(Spindle::new(weaver.clone(), queue));

    handshake(&mut producer, SPINDLE_MAGIC);
    for (sequence, payload) in [(1, b"aaa"), (2, b"bbb"), (3, b"ccc")] {
        batch(&mut producer, channel, sequence, payload);
    }

    // The first batch fills the queue, the second waits for room and the
    // third stays on the connection.
    appender.read_ready(&mut socket);
    assert_eq!(appender.state(), AppenderState::Commit);
    let parked = BatchHeader::SIZE + 3;
    assert_eq!(socket.pending(), parked);
    appender.tick(&mut socket);
    assert_eq!(appender.state(), AppenderState::Commit);
    assert_eq!(socket.pending(), parked);
    appender.write_ready(&mut socket);
    assert!(acks(&mut producer).is_empty());

    let (mut link, mut mirror_end) = replication_link();
    replicator.connected(&mut link);
    appender.tick(&mut socket);
    assert_eq!(appender.state(), AppenderState::Commit);
    assert_eq!(socket.pending(), 0);
    replicator.write_ready(&mut link);
    appender.tick(&mut socket);
    assert_eq!(appender.state(), AppenderState::ReadBatchHeader);
    replicator.write_ready(&mut link);

    appender.write_ready(&mut socket);
    let sequences: Vec<i64> = acks(&mut producer).iter().map(|a| a.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let event_channel = weaver.event_channel(&channel).unwrap();
    assert_eq!(event_channel.next_offset(), 9);
    let mut buf = [0u8; 9];
    event_channel.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"aaabbbccc");

    // The mirror sees the batches in the order they were appended.
    let mut buf = [0u8; Handshake::SIZE];
    mirror_end.read_exact(&mut buf).unwrap();
    assert_eq!(Handshake::parse(&buf, REPLICATOR_MAGIC).unwrap().node, 1);
    for (sequence, payload) in [(1, b"aaa"), (2, b"bbb"), (3, b"ccc")] {
        let mut buf = [0u8; ReplicatedBatchHeader::SIZE];
        mirror_end.read_exact(&mut buf).unwrap();
        let header = ReplicatedBatchHeader::parse(&buf, BATCH_MAGIC).unwrap();
        assert_eq!(header.header.sequence, sequence);
        assert_eq!(header.offset, (sequence as u64 - 1) * 3);
        let mut body = [0u8; 3];
        mirror_end.read_exact(&mut body).unwrap();
        assert_eq!(&body, payload);
    }
}
