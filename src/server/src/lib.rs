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

//! A clustered, replicated, append-only channel buffer.

mod error;
pub use error::{is_closed, Error, Result};

mod config;
pub use config::{
    ChannelConfig, Config, CoordinatorConfig, NodeConfig, PeerConfig, ReactorConfig,
    ReplicationConfig,
};

pub mod ack;
pub mod appender;
pub mod channel;
pub mod coordinator;
pub mod frame;
pub mod layout;
pub mod node;
pub mod reactor;
pub mod rendezvous;
pub mod replicator;
pub mod ring;
pub mod segment;
pub mod sink;
pub mod timer;
pub mod weaver;
pub mod xerox;

mod server;
pub use server::{run, Server, StaticSwitchboard};
