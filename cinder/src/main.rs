// cinder is the operator tool for cinder exchange nodes.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use cinder_common::config::{NodeConfig, PepperEntry};
use cinder_common::system;
use cinder_common::vault::PEPPER_LEN;
use cinder_common::ConfigError;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the node configuration file.
    #[arg(short, long, default_value = NodeConfig::PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform basic initialization of the local node.
    Init {
        /// The directory exchange records and blob bytes are stored under.
        #[arg(long, default_value = "/var/lib/cinder")]
        data_dir: PathBuf,
        /// The network address `cinderd` binds to.
        /// The default is `[::]:20629` (dual stack).
        bind_addr: Option<SocketAddr>,
    },
    /// Stage a freshly generated pepper version and make it active.
    Rotate,
    /// Remove a retired pepper version from the configuration.
    Revoke {
        /// The pepper version to remove. Sealed records referencing it
        /// become permanently unreadable.
        version: i16,
    },
    /// Print a non-secret summary of the node configuration.
    Status,
}

fn generate_pepper(version: i16) -> PepperEntry {
    PepperEntry {
        version,
        hex: hex::encode(system::random_bytes(PEPPER_LEN)),
    }
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            data_dir,
            bind_addr,
        } => {
            if Path::new(&cli.config).exists() {
                return Err(ConfigError::Exists.into());
            }

            let node_config = NodeConfig {
                bind_addr,
                data_dir,
                active_pepper: 1,
                peppers: vec![generate_pepper(1)],
                session_timeout_secs: 300,
                ack_timeout_secs: 30,
                clock_skew_secs: 60,
                max_blob_bytes: 64 * 1024 * 1024,
                cleanup_interval_secs: 60,
            };

            node_config.save_to(&cli.config)?;
            println!("Initialized with pepper version 1 active");
        }
        Commands::Rotate => {
            let mut node_config = NodeConfig::load_from(&cli.config)?;

            let version = node_config
                .latest_pepper_version()
                .unwrap_or(0)
                .saturating_add(1);

            node_config.peppers.push(generate_pepper(version));
            node_config.active_pepper = version;
            node_config.save_to(&cli.config)?;

            println!("Pepper version {} staged and activated", version);
        }
        Commands::Revoke { version } => {
            let mut node_config = NodeConfig::load_from(&cli.config)?;

            if version == node_config.active_pepper {
                return Err(Error::RevokeActive(version));
            }
            if !node_config
                .peppers
                .iter()
                .any(|entry| entry.version == version)
            {
                return Err(Error::NoSuchVersion(version));
            }

            node_config.peppers.retain(|entry| entry.version != version);
            node_config.save_to(&cli.config)?;

            println!(
                "Pepper version {} revoked; exchanges sealed under it are unreadable now",
                version
            );
        }
        Commands::Status => {
            let node_config = NodeConfig::load_from(&cli.config)?;

            let versions: Vec<String> = node_config
                .peppers
                .iter()
                .map(|entry| entry.version.to_string())
                .collect();

            println!("data directory:   {}", node_config.data_dir.display());
            match node_config.bind_addr {
                Some(bind_addr) => println!("bind address:     {}", bind_addr),
                None => println!("bind address:     default ([::]:20629)"),
            }
            println!("pepper versions:  {}", versions.join(", "));
            println!("active pepper:    {}", node_config.active_pepper);
            println!("session timeout:  {} s", node_config.session_timeout_secs);
            println!("ack timeout:      {} s", node_config.ack_timeout_secs);
            println!("clock skew:       {} s", node_config.clock_skew_secs);
            println!("max blob size:    {} bytes", node_config.max_blob_bytes);
            println!("cleanup interval: {} s", node_config.cleanup_interval_secs);
        }
    }

    Ok(())
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
