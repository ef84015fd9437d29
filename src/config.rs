//
// Copyright 2025 The gRPC Gateway Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Gateway configuration.
//!
//! The gateway reads its options from the `[grpc]` section of the host
//! configuration file. Defaults mirror the behavior of a stock gRPC server:
//! 50 MiB message limits, a 2 hour keepalive ping, 10 concurrent streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable that tells workers which dispatch mode spawned them.
pub const RR_MODE: &str = "RR_MODE";

/// Value of [`RR_MODE`] for workers serving gRPC traffic.
pub const GRPC_MODE: &str = "grpc";

/// Configuration file section consumed by the gateway.
const SECTION: &str = "grpc";

const MIB: u64 = 1024 * 1024;
const DEFAULT_MSG_SIZE_MIB: u64 = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration carries no `[grpc]` section; the gateway refuses to
    /// start rather than run with implicit defaults.
    #[error("configuration has no `grpc` section")]
    Disabled,
    #[error("malformed grpc address, provided: {0}")]
    MalformedAddress(String),
    #[error("proto file '{0}' does not exist")]
    ProtoFileMissing(PathBuf),
    #[error("descriptor set '{0}' does not exist")]
    DescriptorSetMissing(PathBuf),
    #[error("key file '{0}' does not exist")]
    KeyFileMissing(PathBuf),
    #[error("cert file '{0}' does not exist")]
    CertFileMissing(PathBuf),
    #[error("root ca path provided, but file '{0}' does not exist")]
    RootCaMissing(PathBuf),
    #[error("invalid glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the server treats client certificates during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthType {
    #[default]
    NoClientCert,
    RequestClientCert,
    RequireAnyClientCert,
    VerifyClientCertIfGiven,
    RequireAndVerifyClientCert,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub key: PathBuf,
    #[serde(default)]
    pub cert: PathBuf,
    /// Optional client CA bundle; enables mutual TLS when present.
    #[serde(default)]
    pub root_ca: Option<PathBuf>,
    /// Only consulted when `root_ca` is set.
    #[serde(default)]
    pub client_auth_type: ClientAuthType,
}

/// Worker pool sizing and timeouts. Opaque to the gateway; handed to the
/// pool factory as-is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub num_workers: u64,
    #[serde(default)]
    pub max_jobs: u64,
    #[serde(default, with = "humantime_serde")]
    pub allocate_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub destroy_timeout: Option<Duration>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `host:port` bind address.
    #[serde(default)]
    pub listen: String,

    /// Protobuf source files describing the proxied services. Globs allowed.
    #[serde(default)]
    pub proto: Vec<String>,

    /// Serialized `FileDescriptorSet` blobs, for services compiled ahead of
    /// time.
    #[serde(default)]
    pub descriptor_sets: Vec<PathBuf>,

    /// Extra import roots for proto compilation. Each proto file's parent
    /// directory is always an import root.
    #[serde(default)]
    pub import_paths: Vec<PathBuf>,

    /// Register the gRPC reflection service for the loaded descriptors.
    #[serde(default)]
    pub reflection: bool,

    pub tls: Option<TlsConfig>,

    /// Extra environment passed to worker processes. `RR_MODE=grpc` is
    /// always injected.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Megabytes; 0 means the 50 MiB default.
    #[serde(default)]
    pub max_send_msg_size: u64,
    /// Megabytes; 0 means the 50 MiB default.
    #[serde(default)]
    pub max_recv_msg_size: u64,

    #[serde(default, with = "humantime_serde")]
    pub max_connection_idle: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_connection_age: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_connection_age_grace: Option<Duration>,

    #[serde(default)]
    pub max_concurrent_streams: u32,

    #[serde(default, with = "humantime_serde")]
    pub ping_time: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Config {
    /// Extracts and validates the gateway section of a TOML configuration
    /// document. [`ConfigError::Disabled`] means the section is absent.
    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        let document: toml::Value = raw.parse()?;
        let section = document.get(SECTION).ok_or(ConfigError::Disabled)?;
        let mut config: Config = section.clone().try_into()?;
        config.init_defaults()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Config::from_toml_str(&raw)
    }

    /// Applies defaults and validates file references. Idempotent.
    pub fn init_defaults(&mut self) -> Result<(), ConfigError> {
        if !self.listen.contains(':') {
            return Err(ConfigError::MalformedAddress(self.listen.clone()));
        }

        self.proto = expand_protos(&self.proto)?;

        for set in &self.descriptor_sets {
            if !set.exists() {
                return Err(ConfigError::DescriptorSetMissing(set.clone()));
            }
        }

        if self.tls_enabled() {
            let tls = self.tls.as_ref().unwrap();
            if !tls.key.exists() {
                return Err(ConfigError::KeyFileMissing(tls.key.clone()));
            }
            if !tls.cert.exists() {
                return Err(ConfigError::CertFileMissing(tls.cert.clone()));
            }
            if let Some(root_ca) = &tls.root_ca {
                if !root_ca.exists() {
                    return Err(ConfigError::RootCaMissing(root_ca.clone()));
                }
            }
        }

        self.env
            .entry(RR_MODE.to_string())
            .or_insert_with(|| GRPC_MODE.to_string());

        if self.ping_time.is_none() {
            self.ping_time = Some(Duration::from_secs(2 * 60 * 60));
        }
        if self.timeout.is_none() {
            self.timeout = Some(Duration::from_secs(20));
        }
        if self.max_concurrent_streams == 0 {
            self.max_concurrent_streams = 10;
        }
        if self.max_recv_msg_size == 0 {
            self.max_recv_msg_size = DEFAULT_MSG_SIZE_MIB;
        }
        if self.max_send_msg_size == 0 {
            self.max_send_msg_size = DEFAULT_MSG_SIZE_MIB;
        }
        // max_connection_idle/age/grace: `None` means no limit.

        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        match &self.tls {
            Some(tls) => !tls.key.as_os_str().is_empty() && !tls.cert.as_os_str().is_empty(),
            None => false,
        }
    }

    /// Receive limit in bytes.
    pub fn max_recv_bytes(&self) -> usize {
        (self.max_recv_msg_size * MIB) as usize
    }

    /// Send limit in bytes.
    pub fn max_send_bytes(&self) -> usize {
        (self.max_send_msg_size * MIB) as usize
    }
}

/// Expands the configured proto list: glob patterns resolve to whatever they
/// match (possibly nothing), explicit paths must exist.
fn expand_protos(patterns: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut protos = Vec::with_capacity(patterns.len());

    for path in patterns {
        if path.is_empty() {
            continue;
        }

        if path.contains(['*', '?', '[']) {
            let matches = glob::glob(path).map_err(|source| ConfigError::Glob {
                pattern: path.clone(),
                source,
            })?;
            for entry in matches.flatten() {
                protos.push(entry.to_string_lossy().into_owned());
            }
            continue;
        }

        if !Path::new(path).exists() {
            return Err(ConfigError::ProtoFileMissing(PathBuf::from(path)));
        }
        protos.push(path.clone());
    }

    Ok(protos)
}
