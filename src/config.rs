// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reloadable gateway configuration.
//!
//! The YAML file names the reachable backend devices and maps client-facing
//! unit ids to `(backend, target unit id)` pairs. [`Config::reload`] builds a
//! complete new index set before swapping it in under the writer lock, so
//! concurrent readers always observe one consistent generation and a failed
//! reload leaves the previous configuration untouched.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use serde::Deserialize;
use thiserror::Error;

use crate::frame::UnitId;

/// Error type for loading and validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("backend requires a name")]
    MissingName,

    #[error("backend {0} requires an address")]
    MissingAddress(String),

    #[error("backend {0}: address {1} is not host:port")]
    InvalidAddress(String, String),

    #[error("backend name {0} is duplicate")]
    DuplicateBackend(String),

    #[error("unit id {0} is out of range 1..=255")]
    InvalidUnitId(u8),

    #[error("unit id {0} is mapped more than once")]
    DuplicateUnitId(u8),

    #[error("cannot find backend {0}")]
    UnknownBackend(String),
}

/// Wire protocol used to reach a backend device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Tls,
    Serial,
}

/// Parity setting of a serial backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Parity {
    N,
    E,
    O,
}

/// Configuration of one backend device.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,

    pub protocol: Protocol,

    /// `host:port` for `tcp`/`tls` backends, a device path for `serial`.
    #[serde(default)]
    pub address: String,

    /// Per-request timeout in milliseconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout: u64,

    /// Connection pool size; forced to 1 for serial backends.
    #[serde(default)]
    pub connections: usize,

    /// Verify the server certificate of a `tls` backend.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// PEM bundle with the CA certificates trusted for a `tls` backend.
    #[serde(default)]
    pub tls_ca_cert: Option<PathBuf>,

    #[serde(default)]
    pub baudrate: u32,

    #[serde(default)]
    pub databits: u8,

    #[serde(default)]
    pub stopbits: u8,

    #[serde(default = "default_parity")]
    pub parity: Parity,
}

fn default_tls_verify() -> bool {
    true
}

fn default_parity() -> Parity {
    Parity::N
}

impl BackendConfig {
    fn fill_defaults(&mut self) {
        if self.protocol == Protocol::Serial {
            if self.baudrate == 0 {
                self.baudrate = 9600;
            }
            if self.databits == 0 {
                self.databits = 8;
            }
            if self.stopbits == 0 {
                self.stopbits = 1;
            }
        }
        // A serial bus carries one transaction at a time; pooling does not
        // apply there.
        if self.connections == 0 || self.protocol == Protocol::Serial {
            self.connections = 1;
        }
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.fill_defaults();
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.address.is_empty() {
            return Err(ConfigError::MissingAddress(self.name.clone()));
        }
        match self.protocol {
            Protocol::Tcp | Protocol::Tls => self.validate_addr(),
            // Parity validity is already enforced by the deserializer.
            Protocol::Serial => Ok(()),
        }
    }

    fn validate_addr(&self) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidAddress(self.name.clone(), self.address.clone());
        let (host, port) = self.address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(())
    }

    /// The host part of a `host:port` address, used as the TLS server name.
    pub(crate) fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
    }
}

/// One client-facing unit id routed to a unit on a named backend.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitMapping {
    pub unit_id: UnitId,
    pub backend: String,
    pub target_unit_id: UnitId,
}

impl UnitMapping {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.unit_id == 0 {
            return Err(ConfigError::InvalidUnitId(self.unit_id));
        }
        if self.target_unit_id == 0 {
            return Err(ConfigError::InvalidUnitId(self.target_unit_id));
        }
        Ok(())
    }
}

/// The raw shape of the YAML file.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    backends: Vec<BackendConfig>,

    #[serde(default)]
    unit_map: Vec<UnitMapping>,
}

#[derive(Debug, Default)]
struct Indices {
    backends_by_name: HashMap<String, Arc<BackendConfig>>,
    units: HashMap<UnitId, (UnitMapping, Arc<BackendConfig>)>,
}

fn build_indices(file: ConfigFile) -> Result<Indices, ConfigError> {
    let mut backends_by_name = HashMap::new();
    for mut backend in file.backends {
        backend.validate()?;
        let name = backend.name.clone();
        if backends_by_name
            .insert(name.clone(), Arc::new(backend))
            .is_some()
        {
            return Err(ConfigError::DuplicateBackend(name));
        }
    }
    let mut units = HashMap::new();
    for mapping in file.unit_map {
        mapping.validate()?;
        let backend = backends_by_name
            .get(&mapping.backend)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBackend(mapping.backend.clone()))?;
        let unit_id = mapping.unit_id;
        if units.insert(unit_id, (mapping, backend)).is_some() {
            return Err(ConfigError::DuplicateUnitId(unit_id));
        }
    }
    Ok(Indices {
        backends_by_name,
        units,
    })
}

/// The validated gateway configuration with its derived lookup indices.
pub struct Config {
    path: PathBuf,
    indices: RwLock<Indices>,
}

impl Config {
    /// Load the file at `path`. Fails if it cannot be read or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let config = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            indices: RwLock::new(Indices::default()),
        });
        config.reload()?;
        Ok(config)
    }

    /// Re-read and validate the configuration file.
    ///
    /// On error the previously loaded configuration stays in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let data = fs::read_to_string(&self.path)?;
        let file: ConfigFile = serde_yaml::from_str(&data)?;
        let indices = build_indices(file)?;
        let mut guard = match self.indices.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = indices;
        Ok(())
    }

    /// Look up the mapping and backend configuration for a client-facing
    /// unit id.
    pub(crate) fn unit_mapping(&self, unit_id: UnitId) -> Option<(UnitMapping, Arc<BackendConfig>)> {
        let guard = match self.indices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .units
            .get(&unit_id)
            .map(|(mapping, backend)| (mapping.clone(), Arc::clone(backend)))
    }

    /// Look up a backend configuration by name.
    pub(crate) fn backend_by_name(&self, name: &str) -> Option<Arc<BackendConfig>> {
        let guard = match self.indices.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.backends_by_name.get(name).cloned()
    }
}
