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

//! Service discovery from protobuf descriptors.
//!
//! Two input modes feed the same descriptor pool: `.proto` sources compiled
//! in-process, and precompiled `FileDescriptorSet` blobs. The gateway only
//! needs the service/method topology out of it; message schemas are ignored
//! because payloads are proxied opaquely.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorSet;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("proto compilation failed: {0}")]
    Compile(#[from] protox::Error),
    #[error("failed to register file descriptor: {0}")]
    Register(#[from] prost_reflect::DescriptorError),
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A single RPC method of a proxied service.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodDescriptor {
    /// Only unary methods are dispatched to workers.
    pub fn is_unary(&self) -> bool {
        !self.client_streaming && !self.server_streaming
    }
}

/// A service declared by the loaded descriptors.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub package: String,
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    /// Descriptor file the service was declared in; serves as the service
    /// metadata for reflection.
    pub source_file: String,
}

impl ServiceDescriptor {
    /// Fully-qualified service name as it appears on the wire.
    pub fn full_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }
}

/// Result of descriptor loading: the services to proxy plus the merged
/// descriptor set for the optional reflection endpoint.
pub struct LoadedServices {
    pub services: Vec<ServiceDescriptor>,
    pub descriptor_set: FileDescriptorSet,
}

/// Loads every service named by the configuration.
///
/// Files already present in the pool are skipped (re-registering a known
/// descriptor is not an error); individual malformed precompiled sets are
/// warned about and skipped; missing source files have already been rejected
/// by config validation.
pub fn load_services(config: &Config) -> Result<LoadedServices, DescriptorError> {
    let mut pool = DescriptorPool::new();
    let mut registered = 0usize;
    let mut skipped = 0usize;

    if !config.proto.is_empty() {
        let compiled = protox::compile(&config.proto, import_roots(config))?;
        merge_set(&mut pool, compiled, &mut registered, &mut skipped)?;
    }

    for path in &config.descriptor_sets {
        let bytes = std::fs::read(path).map_err(|source| DescriptorError::Io {
            path: path.clone(),
            source,
        })?;
        match FileDescriptorSet::decode(bytes.as_slice()) {
            Ok(set) => merge_set(&mut pool, set, &mut registered, &mut skipped)?,
            Err(err) => {
                warn!(
                    "skipping malformed descriptor set '{}': {}",
                    path.display(),
                    err
                );
            }
        }
    }

    info!(
        "proto descriptors registered; registered: {registered}, skipped: {skipped}, services: {}",
        pool.services().count()
    );

    let services = pool
        .services()
        .map(|service| ServiceDescriptor {
            package: service.parent_file().package_name().to_string(),
            name: service.name().to_string(),
            methods: service
                .methods()
                .map(|method| MethodDescriptor {
                    name: method.name().to_string(),
                    client_streaming: method.is_client_streaming(),
                    server_streaming: method.is_server_streaming(),
                })
                .collect(),
            source_file: service.parent_file().name().to_string(),
        })
        .collect();

    let descriptor_set = FileDescriptorSet {
        file: pool.file_descriptor_protos().cloned().collect(),
    };

    Ok(LoadedServices {
        services,
        descriptor_set,
    })
}

/// Import roots for compilation: the configured paths plus each proto file's
/// parent directory.
fn import_roots(config: &Config) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut roots = Vec::new();

    for path in &config.import_paths {
        if seen.insert(path.clone()) {
            roots.push(path.clone());
        }
    }
    for proto in &config.proto {
        if let Some(parent) = Path::new(proto).parent() {
            let parent = if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            };
            if seen.insert(parent.clone()) {
                roots.push(parent);
            }
        }
    }

    roots
}

fn merge_set(
    pool: &mut DescriptorPool,
    set: FileDescriptorSet,
    registered: &mut usize,
    skipped: &mut usize,
) -> Result<(), DescriptorError> {
    for file in set.file {
        let name = file.name().to_string();
        if pool.get_file_by_name(&name).is_some() {
            debug!("descriptor file '{name}' already registered, skipping");
            *skipped += 1;
            continue;
        }
        pool.add_file_descriptor_proto(file)?;
        *registered += 1;
    }
    Ok(())
}
