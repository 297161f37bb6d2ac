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

use std::{collections::BTreeSet, io, sync::Arc, thread};

use tracing::{debug, error, info, trace, warn};

use crate::{
    coordinator::{Coordinator, Envelope, Input, Switchboard},
    node::{ContactInformation, Node},
    reactor::{Reactor, ReactorHandle},
    timer::TokioScheduler,
    weaver::Weaver,
    Config, Error, Result,
};

/// A switchboard for a membership fixed by configuration. Every node builds
/// the same ring from the same peer list, so there is nothing to exchange:
/// messages are logged and dropped.
pub struct StaticSwitchboard {
    node: Node,
}

impl StaticSwitchboard {
    pub fn new(node: Node) -> Self {
        StaticSwitchboard { node }
    }
}

impl Switchboard for StaticSwitchboard {
    fn send(&self, envelope: Envelope, to: Node) {
        debug!(
            "node {} drops {} to {}",
            self.node.id,
            envelope.message.kind(),
            to
        );
    }

    fn ring_cast(&self, envelope: Envelope) {
        trace!("node {} drops ring cast {}", self.node.id, envelope.message.kind());
    }

    fn forward_to_next_in_ring(&self, envelope: Envelope, _members: &BTreeSet<Node>) {
        trace!("node {} drops forward {}", self.node.id, envelope.message.kind());
    }

    fn dead_members(&self) -> BTreeSet<Node> {
        BTreeSet::new()
    }

    fn new_members(&self) -> BTreeSet<Node> {
        BTreeSet::new()
    }
}

/// One storage node: the weaver, the reactor serving its three endpoints,
/// and the coordinator placing its channels.
pub struct Server {
    config: Config,
    contact: ContactInformation,
    weaver: Arc<Weaver>,
    reactor: Reactor,
    runtime: tokio::runtime::Runtime,
    coordinator: Coordinator,
}

impl Server {
    pub fn new(config: Config) -> Result<Server> {
        let switchboard = Arc::new(StaticSwitchboard::new(config.local_node()));
        Server::with_switchboard(config, switchboard)
    }

    /// Builds a node whose coordinator talks through `switchboard`. The
    /// configured peers still form the first ring.
    pub fn with_switchboard(config: Config, switchboard: Arc<dyn Switchboard>) -> Result<Server> {
        let mut reactor = Reactor::new(&config.reactor)?;
        let handle = reactor.handle();
        let weaver = Arc::new(Weaver::new(&config, Arc::new(handle))?);
        let configured = config.contact()?;

        let spindle = {
            let weaver = weaver.clone();
            reactor.listen(
                configured.spindle,
                Box::new(move |wakeup| weaver.spindle(wakeup)),
            )?
        };
        let replicator = {
            let weaver = weaver.clone();
            reactor.listen(
                configured.replicator,
                Box::new(move |_| weaver.replication()),
            )?
        };
        let xerox = {
            let weaver = weaver.clone();
            reactor.listen(configured.xerox, Box::new(move |_| weaver.sink()))?
        };
        let contact = ContactInformation {
            spindle,
            replicator,
            xerox,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("spindle-timer")
            .enable_all()
            .build()?;
        let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
        let mut coordinator =
            Coordinator::new(weaver.clone(), switchboard, scheduler, &config.coordinator);
        for peer in &config.peers {
            coordinator.add_member(Node::new(peer.id, peer.capacity), peer.contact);
        }

        Ok(Server {
            config,
            contact,
            weaver,
            reactor,
            runtime,
            coordinator,
        })
    }

    /// The bound endpoints.
    pub fn contact(&self) -> ContactInformation {
        self.contact
    }

    pub fn weaver(&self) -> Arc<Weaver> {
        self.weaver.clone()
    }

    pub fn reactor_handle(&self) -> ReactorHandle {
        self.reactor.handle()
    }

    /// Accepts `Input::Shutdown` to stop the node.
    pub fn mailbox(&self) -> std::sync::mpsc::Sender<Input> {
        self.coordinator.mailbox()
    }

    /// Serves until shutdown is requested through the mailbox or by ctrl-c.
    pub fn run(self) -> Result<()> {
        let Server {
            config,
            contact,
            weaver,
            mut reactor,
            runtime,
            mut coordinator,
        } = self;
        let node = config.local_node();
        let handle = reactor.handle();
        let reactor_thread = thread::Builder::new()
            .name("spindle-reactor".to_owned())
            .spawn(move || reactor.run())?;

        let mailbox = coordinator.mailbox();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("receive ctrl-c, shutting down");
                let _ = mailbox.send(Input::Shutdown);
            }
        });

        info!("{} serves producers at {}", node, contact.spindle);
        if config.peers.is_empty() {
            warn!("{} has no peers, channels cannot be placed", node);
        } else {
            let members = config
                .peers
                .iter()
                .map(|peer| Node::new(peer.id, peer.capacity))
                .collect();
            if let Err(err) = coordinator.start_static(members) {
                handle.shutdown();
                return Err(err);
            }
        }
        for channel in &config.channels {
            if let Err(err) = coordinator.open(*channel, node) {
                warn!("open channel {}: {}", channel, err);
            }
        }

        coordinator.run();

        handle.shutdown();
        let served = match reactor_thread.join() {
            Ok(served) => served,
            Err(_) => {
                error!("reactor thread panicked");
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "reactor thread panicked",
                )))
            }
        };
        weaver.shutdown();
        runtime.shutdown_background();
        served
    }
}

pub fn run(config: Config) -> Result<()> {
    Server::new(config)?.run()
}
