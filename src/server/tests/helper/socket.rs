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

use std::net::SocketAddr;

use socket2::{Domain, Socket, Type};

/// Binds an ephemeral loopback port. The port stays taken while the socket
/// lives, and reusable by a listener once it is dropped.
fn reserve() -> Socket {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    socket.set_reuse_address(true).unwrap();
    socket.set_reuse_port(true).unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    socket.bind(&any.into()).unwrap();
    socket
}

fn port_of(socket: &Socket) -> u16 {
    socket.local_addr().unwrap().as_socket().unwrap().port()
}

pub fn next_avail_port() -> u16 {
    port_of(&reserve())
}

/// Finds `n` distinct ports by holding each one until all are picked.
pub fn next_n_avail_ports(n: usize) -> Vec<u16> {
    let reserved: Vec<Socket> = (0..n).map(|_| reserve()).collect();
    reserved.iter().map(port_of).collect()
}
