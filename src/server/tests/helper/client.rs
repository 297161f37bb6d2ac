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
    net::{SocketAddr, TcpStream},
    thread,
    time::Duration,
};

use spindle_server::{
    frame::{AckFrame, BatchHeader, Frame, Handshake, ACK_MAGIC, SPINDLE_MAGIC},
    node::NodeId,
};
use tracing::debug;
use uuid::Uuid;

/// A blocking producer speaking the spindle protocol.
pub struct Producer {
    node: NodeId,
    stream: TcpStream,
}

impl Producer {
    pub fn connect(addr: SocketAddr, node: NodeId) -> Producer {
        let mut stream = connect_with_retry(addr);
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let handshake = Handshake {
            magic: SPINDLE_MAGIC,
            node,
        };
        stream.write_all(&handshake.to_bytes()).unwrap();
        Producer { node, stream }
    }

    pub fn send(&mut self, channel: Uuid, sequence: i64, payload: &[u8]) {
        let header = BatchHeader::new(self.node, channel, sequence, payload.len() as u32);
        self.stream.write_all(&header.to_bytes()).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    pub fn read_ack(&mut self) -> AckFrame {
        let mut buf = [0u8; AckFrame::SIZE];
        self.stream.read_exact(&mut buf).unwrap();
        AckFrame::parse(&buf, ACK_MAGIC).unwrap()
    }
}

pub fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(err) => {
                debug!("connect {}: {}, retry later", addr, err);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    panic!("cannot connect to {}", addr);
}
