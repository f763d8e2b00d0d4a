// cinder_common is the main cinder library implementing the protocol shared logic.
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

use crate::vault::PepperVault;
use crate::{ConfigError, VaultError};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A `NodeConfig` contains the exchange node settings: where to bind and
/// store data, the sealed-at-rest pepper material, and the protocol
/// timing and size limits.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The network address `cinderd` binds to. The default is `[::]:20629`
    /// (dual stack).
    pub bind_addr: Option<SocketAddr>,
    /// The directory exchange records and blob bytes are stored under.
    pub data_dir: PathBuf,
    /// The pepper version new seals are produced under.
    pub active_pepper: i16,
    /// All configured peppers. Retired versions stay listed until no
    /// sealed record references them anymore.
    pub peppers: Vec<PepperEntry>,
    /// How long an upload or download session stays valid, in seconds.
    pub session_timeout_secs: u32,
    /// How long a delivered download may take to acknowledge, in seconds.
    pub ack_timeout_secs: u32,
    /// The accepted clock skew of request timestamps, in seconds.
    pub clock_skew_secs: u32,
    /// The largest accepted encrypted blob, in bytes.
    pub max_blob_bytes: u64,
    /// How often the daemon sweeps expired exchanges, in seconds.
    pub cleanup_interval_secs: u32,
}

/// A `PepperEntry` is one versioned pepper in the configuration file.
///
/// **DO NOT reuse pepper material across nodes and keep this file
/// readable by root only. Whoever holds a pepper can open the sealed
/// metadata of every exchange on the node.**
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PepperEntry {
    /// The pepper version referenced by sealed blobs.
    pub version: i16,
    /// The pepper as 64 hex characters (32 bytes).
    pub hex: String,
}

impl NodeConfig {
    pub const PATH: &'static str = "/etc/cinder.conf";

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::PATH)
    }

    /// Loads a configuration file from a custom location.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(ConfigError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::PATH)
    }

    /// Saves the configuration to a custom location.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(path)?;

        write!(f, "{}", s)?;
        Ok(())
    }

    /// Moves the pepper material out of the configuration and into a
    /// [`PepperVault`], leaving the entry list empty. After this call the
    /// key bytes exist only inside the vault's safe buffers.
    pub fn take_vault(&mut self) -> Result<PepperVault, VaultError> {
        let mut peppers = HashMap::with_capacity(self.peppers.len());

        for entry in self.peppers.drain(..) {
            if peppers.insert(entry.version, entry.hex).is_some() {
                return Err(VaultError::DuplicatePepper(entry.version));
            }
        }

        PepperVault::new(peppers, self.active_pepper)
    }

    /// Returns the highest configured pepper version.
    pub fn latest_pepper_version(&self) -> Option<i16> {
        self.peppers.iter().map(|entry| entry.version).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::PEPPER_LEN;

    fn sample_config() -> NodeConfig {
        NodeConfig {
            bind_addr: None,
            data_dir: PathBuf::from("/var/lib/cinder"),
            active_pepper: 1,
            peppers: vec![PepperEntry {
                version: 1,
                hex: hex::encode([0x42; PEPPER_LEN]),
            }],
            session_timeout_secs: 300,
            ack_timeout_secs: 30,
            clock_skew_secs: 60,
            max_blob_bytes: 64 * 1024 * 1024,
            cleanup_interval_secs: 60,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.conf");

        let config = sample_config();
        config.save_to(&path).unwrap();

        assert_eq!(NodeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_insecure_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cinder.conf");

        sample_config().save_to(&path).unwrap();

        let f = File::open(&path).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o0644);
        std::fs::set_permissions(&path, perms).unwrap();

        assert!(matches!(
            NodeConfig::load_from(&path),
            Err(ConfigError::InsecurePerms)
        ));
    }

    #[test]
    fn take_vault_drains_the_peppers() {
        let mut config = sample_config();
        let vault = config.take_vault().unwrap();

        assert!(config.peppers.is_empty());
        assert_eq!(vault.active_version(), 1);
    }

    #[test]
    fn take_vault_rejects_duplicate_versions() {
        let mut config = sample_config();
        config.peppers.push(PepperEntry {
            version: 1,
            hex: hex::encode([0x43; PEPPER_LEN]),
        });

        assert!(matches!(
            config.take_vault(),
            Err(VaultError::DuplicatePepper(1))
        ));
    }
}
