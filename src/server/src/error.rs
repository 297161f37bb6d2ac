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

use std::io;

use uuid::Uuid;

use crate::node::NodeId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("insufficient members, require {required} but {available} available")]
    InsufficientMembers { required: usize, available: usize },

    #[error("invalid magic {actual:#010x}, expect {expected:#010x}")]
    InvalidMagic { expected: i32, actual: i32 },

    #[error("channel {0} not found")]
    ChannelNotFound(Uuid),

    #[error("illegal transition on {event} in state {state}")]
    IllegalTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("unknown member {0}")]
    UnknownMember(NodeId),

    #[error("io {0}")]
    Io(#[from] io::Error),

    #[error("json {0}")]
    Json(#[from] serde_json::Error),

    #[error("addr parse {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is an ordinary close initiated by the peer.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Io(err) => is_closed(err),
            _ => false,
        }
    }
}

/// Returns true if the io error describes a connection closed by the remote side.
pub fn is_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

pub(crate) fn closed_by_peer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}
