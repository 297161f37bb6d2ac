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

use std::{fs, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use spindle_server::Config;
use tracing::info;

#[derive(Parser)]
pub struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

impl Command {
    pub fn run(self) -> Result<()> {
        match self.subcmd {
            SubCommand::Start(cmd) => cmd.run(),
        }
    }
}

#[derive(Parser)]
enum SubCommand {
    Start(StartCommand),
}

#[derive(Parser)]
struct StartCommand {
    /// Id of this node in the cluster.
    #[clap(long)]
    node_id: Option<u32>,

    /// Hash ring weight of this node.
    #[clap(long)]
    capacity: Option<u32>,

    /// Root dir of the channel buffer.
    #[clap(long)]
    root_dir: Option<PathBuf>,

    /// Address producers connect to.
    #[clap(long)]
    spindle_addr: Option<String>,

    /// Address primaries replicate to.
    #[clap(long)]
    replication_addr: Option<String>,

    /// Address bulk transfers arrive at.
    #[clap(long)]
    xerox_addr: Option<String>,

    /// Maximum size of a segment, in bytes.
    #[clap(long)]
    max_segment_size: Option<u64>,

    /// Path to toml config file.
    #[clap(short, long)]
    config: Option<String>,
}

impl StartCommand {
    fn run(self) -> Result<()> {
        let config = match &self.config {
            None => Config::default(),
            Some(path) => {
                let content = fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
        };
        let config = apply_from_args(config, self);
        info!(
            "start node {} with {} peers at {}",
            config.node.id,
            config.peers.len(),
            config.root_dir.display()
        );
        spindle_server::run(config)?;
        Ok(())
    }
}

/// Prefer values from args to those from the config file.
fn apply_from_args(mut config: Config, args: StartCommand) -> Config {
    if let Some(node_id) = args.node_id {
        config.node.id = node_id;
    }
    if let Some(capacity) = args.capacity {
        config.node.capacity = capacity;
    }
    if let Some(root_dir) = args.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(addr) = args.spindle_addr {
        config.spindle_addr = addr;
    }
    if let Some(addr) = args.replication_addr {
        config.replication_addr = addr;
    }
    if let Some(addr) = args.xerox_addr {
        config.xerox_addr = addr;
    }
    if let Some(max_segment_size) = args.max_segment_size {
        config.channel.max_segment_size = max_segment_size;
    }
    config
}
