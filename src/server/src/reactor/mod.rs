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

//! The readiness loop that drives every protocol state machine.
//!
//! Handlers never own their socket. The loop passes it in on every
//! readiness callback and re-arms the registration with whatever the
//! handler selects next.

mod server;

use std::{net::SocketAddr, sync::Arc};

pub use self::server::{Reactor, ReactorHandle};
use crate::Result;

pub type Socket = mio::net::TcpStream;

/// What a handler wants to be told about next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Select {
    Read,
    Write,
    ReadWrite,
    Close,
}

/// Pokes a connection from another thread, eg. when work has been queued
/// for it.
pub trait Wakeup: Send + Sync {
    fn wakeup(&self);
}

pub trait Handler<S>: Send {
    /// An inbound connection has been accepted.
    fn accepted(&mut self, _socket: &mut S) -> Select {
        Select::Read
    }

    /// An outbound connection has been established.
    fn connected(&mut self, _socket: &mut S) -> Select {
        Select::Write
    }

    fn read_ready(&mut self, socket: &mut S) -> Select;

    fn write_ready(&mut self, socket: &mut S) -> Select;

    /// Another thread queued work for this connection.
    fn woken(&mut self, socket: &mut S) -> Select {
        self.write_ready(socket)
    }

    /// Invoked on every loop tick; `None` keeps the current registration.
    fn tick(&mut self, _socket: &mut S) -> Option<Select> {
        None
    }

    /// The connection is gone, or was never established.
    fn closed(&mut self) {}
}

pub type BoxHandler = Box<dyn Handler<Socket>>;

/// Builds the handler of an accepted connection.
pub type HandlerFactory = Box<dyn Fn(Arc<dyn Wakeup>) -> BoxHandler + Send>;

/// Starts outbound connections.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: SocketAddr, handler: BoxHandler) -> Result<Arc<dyn Wakeup>>;
}

/// A wakeup that does nothing, for handlers driven by hand.
pub struct NoopWakeup;

impl Wakeup for NoopWakeup {
    fn wakeup(&self) {}
}
