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
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::{mpsc::Sender, Arc, Mutex},
};

use spindle_server::{
    channel::Role,
    coordinator::{ring_of, Envelope, Input, Switchboard},
    node::{Node, NodeId},
    ring::point,
    Server,
};
use uuid::Uuid;

use crate::helper::{
    client::Producer,
    context::{wait_for, TestContext},
};

#[ctor::ctor]
fn init() {
    tracing_subscriber::fmt::init();
}

/// An in-process membership layer: messages go straight into mailboxes and
/// the test decides who is dead.
#[derive(Default)]
struct Bus {
    mailboxes: Mutex<BTreeMap<NodeId, Sender<Input>>>,
    dead: Mutex<BTreeSet<Node>>,
}

impl Bus {
    fn attach(&self, node: NodeId, mailbox: Sender<Input>) {
        self.mailboxes.lock().unwrap().insert(node, mailbox);
    }

    fn kill(&self, node: Node) {
        if let Some(mailbox) = self.mailboxes.lock().unwrap().remove(&node.id) {
            let _ = mailbox.send(Input::Shutdown);
        }
        self.dead.lock().unwrap().insert(node);
    }

    fn post(&self, node: NodeId, input: Input) {
        if let Some(mailbox) = self.mailboxes.lock().unwrap().get(&node) {
            let _ = mailbox.send(input);
        }
    }

    fn shutdown(&self) {
        for mailbox in std::mem::take(&mut *self.mailboxes.lock().unwrap()).into_values() {
            let _ = mailbox.send(Input::Shutdown);
        }
    }
}

struct Port {
    node: Node,
    bus: Arc<Bus>,
}

impl Switchboard for Port {
    fn send(&self, envelope: Envelope, to: Node) {
        self.bus.post(to.id, Input::Dispatch(envelope));
    }

    fn ring_cast(&self, envelope: Envelope) {
        let members: Vec<NodeId> = self.bus.mailboxes.lock().unwrap().keys().copied().collect();
        for member in members.into_iter().filter(|id| *id != self.node.id) {
            self.bus.post(member, Input::Dispatch(envelope.clone()));
        }
    }

    fn forward_to_next_in_ring(&self, envelope: Envelope, members: &BTreeSet<Node>) {
        let next = members
            .range((Bound::Excluded(self.node), Bound::Unbounded))
            .next()
            .or_else(|| members.iter().next())
            .copied();
        if let Some(next) = next {
            // The ring message has come back around to where it started.
            if next != envelope.sender && next != self.node {
                self.bus.post(next.id, Input::Dispatch(envelope));
            }
        }
    }

    fn dead_members(&self) -> BTreeSet<Node> {
        self.bus.dead.lock().unwrap().clone()
    }

    fn new_members(&self) -> BTreeSet<Node> {
        BTreeSet::new()
    }
}

struct Cluster {
    ctx: TestContext,
    bus: Arc<Bus>,
    weavers: HashMap<NodeId, Arc<spindle_server::weaver::Weaver>>,
    contacts: HashMap<NodeId, spindle_server::node::ContactInformation>,
}

impl Cluster {
    fn start(name: &str, ids: &[NodeId], channels: &[Uuid]) -> Cluster {
        let mut ctx = TestContext::new(name);
        let bus = Arc::new(Bus::default());
        let servers: Vec<Server> = ctx
            .cluster(ids, channels)
            .into_iter()
            .map(|config| {
                let port = Arc::new(Port {
                    node: config.local_node(),
                    bus: bus.clone(),
                });
                Server::with_switchboard(config, port).unwrap()
            })
            .collect();
        let mut weavers = HashMap::new();
        let mut contacts = HashMap::new();
        for server in &servers {
            let id = server.weaver().id();
            bus.attach(id, server.mailbox());
            weavers.insert(id, server.weaver());
            contacts.insert(id, server.contact());
        }
        for server in servers {
            ctx.spawn_server(server);
        }
        Cluster {
            ctx,
            bus,
            weavers,
            contacts,
        }
    }

    fn role_of(&self, node: NodeId, channel: &Uuid) -> Option<Role> {
        self.weavers[&node]
            .event_channel(channel)
            .map(|channel| channel.role())
    }

    fn next_offset(&self, node: NodeId, channel: &Uuid) -> u64 {
        self.weavers[&node]
            .event_channel(channel)
            .map(|channel| channel.next_offset())
            .unwrap_or_default()
    }

    fn wait_for_placement(&self, members: &BTreeSet<Node>, channel: &Uuid) {
        let pair = ring_of(members).hash(point(channel), 2).unwrap();
        wait_for("placement", || {
            self.role_of(pair[0].id, channel) == Some(Role::Primary)
                && self.role_of(pair[1].id, channel) == Some(Role::Mirror)
        });
    }

    fn stop(mut self) {
        self.bus.shutdown();
        self.ctx.shutdown();
    }
}

fn nodes(ids: &[NodeId]) -> BTreeSet<Node> {
    ids.iter().map(|id| Node::new(*id, 1)).collect()
}

#[test]
fn static_cluster_places_channels() {
    let channels: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
    let cluster = Cluster::start("cluster_test__static_placement", &[1, 2, 3], &channels);
    let members = nodes(&[1, 2, 3]);
    for channel in &channels {
        cluster.wait_for_placement(&members, channel);
    }
    // Nobody outside the pair hosts the channel.
    for channel in &channels {
        let hosts = [1, 2, 3]
            .into_iter()
            .filter(|id| cluster.role_of(*id, channel).is_some())
            .count();
        assert_eq!(hosts, 2);
    }
    cluster.stop();
}

#[test]
fn failover_copies_channels_to_new_pair() {
    let before = nodes(&[1, 2, 3]);
    let dead = Node::new(3, 1);
    // A channel node 3 takes part in, so losing it forces a transfer.
    let channel = loop {
        let channel = Uuid::new_v4();
        let pair = ring_of(&before).hash(point(&channel), 2).unwrap();
        if pair.contains(&dead) {
            break channel;
        }
    };
    let old = ring_of(&before).hash(point(&channel), 2).unwrap();
    let survivor = old.iter().find(|node| **node != dead).unwrap().id;
    let newcomer = [1, 2].into_iter().find(|id| *id != survivor).unwrap();

    let cluster = Cluster::start("cluster_test__failover", &[1, 2, 3], &[channel]);
    cluster.wait_for_placement(&before, &channel);

    let mut producer = Producer::connect(cluster.contacts[&old[0].id].spindle, 7);
    producer.send(channel, 1, b"hello");
    assert_eq!(producer.read_ack().sequence, 1);
    wait_for("replicated batch", || {
        cluster.next_offset(old[0].id, &channel) == 5 && cluster.next_offset(old[1].id, &channel) == 5
    });
    assert_eq!(cluster.role_of(newcomer, &channel), None);

    cluster.bus.kill(dead);
    cluster.bus.post(1, Input::Stabilized);
    cluster.bus.post(2, Input::Stabilized);

    let after = nodes(&[1, 2]);
    cluster.wait_for_placement(&after, &channel);
    wait_for("transferred channel", || {
        cluster.next_offset(newcomer, &channel) == 5
    });
    let mut buf = [0u8; 5];
    cluster.weavers[&newcomer]
        .event_channel(&channel)
        .unwrap()
        .read_at(0, &mut buf)
        .unwrap();
    assert_eq!(&buf, b"hello");
    assert_eq!(cluster.next_offset(survivor, &channel), 5);

    cluster.stop();
}
