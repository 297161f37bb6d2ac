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
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use serde::{Deserialize, Serialize};

pub type NodeId = u32;

/// A cluster member. Identity, equality and ordering are all by `id`; the
/// capacity is the number of positions the node claims on the hash ring.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub capacity: u32,
}

impl Node {
    pub fn new(id: NodeId, capacity: u32) -> Self {
        Node { id, capacity }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.id)
    }
}

/// The endpoints a weaver listens on. An entry of the yellow pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInformation {
    /// Producers append batches here.
    pub spindle: SocketAddr,
    /// Primaries replicate committed batches here.
    pub replicator: SocketAddr,
    /// Bulk channel transfers are received here.
    pub xerox: SocketAddr,
}
