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
    collections::{BTreeMap, BTreeSet},
    hash::{Hash, Hasher},
};

use siphasher::sip::SipHasher;
use uuid::Uuid;

use crate::{Error, Result};

/// A consistent hash ring.
///
/// Each member occupies `weight` positions, placed at the hash of
/// `(member, replica)`. Positions are kept sorted and colliding members are
/// ordered by their own `Ord`, so the lookup result only depends on the ring
/// contents, never on the insertion order.
#[derive(Clone, Debug)]
pub struct ConsistentHashRing<T> {
    members: BTreeMap<T, u32>,
    positions: BTreeMap<u64, BTreeSet<T>>,
}

impl<T> Default for ConsistentHashRing<T> {
    fn default() -> Self {
        ConsistentHashRing {
            members: BTreeMap::default(),
            positions: BTreeMap::default(),
        }
    }
}

impl<T> ConsistentHashRing<T>
where
    T: Ord + Clone + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, member: T, weight: u32) {
        if self.members.contains_key(&member) {
            self.remove(&member);
        }
        for replica in 0..weight {
            let position = position_of(&member, replica);
            self.positions
                .entry(position)
                .or_default()
                .insert(member.clone());
        }
        self.members.insert(member, weight);
    }

    pub fn remove(&mut self, member: &T) -> bool {
        let weight = match self.members.remove(member) {
            Some(weight) => weight,
            None => return false,
        };
        for replica in 0..weight {
            let position = position_of(member, replica);
            if let Some(slot) = self.positions.get_mut(&position) {
                slot.remove(member);
                if slot.is_empty() {
                    self.positions.remove(&position);
                }
            }
        }
        true
    }

    /// Returns a copy of this ring with `member` added. The receiver is left
    /// untouched so concurrent readers of the old snapshot are unaffected.
    pub fn with(&self, member: T, weight: u32) -> Self {
        let mut next = self.clone();
        next.add(member, weight);
        next
    }

    /// Returns a copy of this ring with `member` removed.
    pub fn without(&self, member: &T) -> Self {
        let mut next = self.clone();
        next.remove(member);
        next
    }

    /// Walks clockwise from `point`, wrapping around, and collects the first
    /// `k` distinct members encountered.
    pub fn hash(&self, point: u64, k: usize) -> Result<Vec<T>> {
        if self.members.len() < k {
            return Err(Error::InsufficientMembers {
                required: k,
                available: self.members.len(),
            });
        }

        let mut found: Vec<T> = Vec::with_capacity(k);
        let clockwise = self
            .positions
            .range(point..)
            .chain(self.positions.range(..point));
        'walk: for (_, slot) in clockwise {
            for member in slot {
                if !found.contains(member) {
                    found.push(member.clone());
                    if found.len() == k {
                        break 'walk;
                    }
                }
            }
        }
        Ok(found)
    }

    pub fn contains(&self, member: &T) -> bool {
        self.members.contains_key(member)
    }

    pub fn members(&self) -> impl Iterator<Item = &T> {
        self.members.keys()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Maps a channel id onto the hash space.
pub fn point(channel: &Uuid) -> u64 {
    let mut hasher = SipHasher::new();
    hasher.write(channel.as_bytes());
    hasher.finish()
}

fn position_of<T: Hash>(member: &T, replica: u32) -> u64 {
    let mut hasher = SipHasher::new();
    member.hash(&mut hasher);
    replica.hash(&mut hasher);
    hasher.finish()
}
