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

//! A gRPC gateway for external worker pools.
//!
//! The gateway terminates client RPC traffic and dispatches every unary call
//! to a pool of language-agnostic worker processes over a framed IPC
//! envelope: a JSON context document (route, metadata, trace context) plus
//! the untouched request bytes. Workers answer with response bytes and a
//! metadata document that the gateway folds back into gRPC headers, trailers
//! and status.
//!
//! Services are not known at compile time. At startup the gateway ingests
//! protobuf descriptors (compiled from `.proto` sources in-process, or
//! supplied as serialized `FileDescriptorSet` blobs) and synthesizes a
//! catch-all handler per declared service; payloads pass through a raw codec
//! and are never parsed.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use grpc_gateway::{Gateway, PoolFactory};
//!
//! # async fn run(factory: Arc<dyn PoolFactory>) -> anyhow::Result<()> {
//! let raw = std::fs::read_to_string("config.toml")?;
//! let gateway = Arc::new(Gateway::from_toml_str(&raw, factory)?);
//!
//! let serving = gateway.clone();
//! tokio::spawn(async move { serving.serve().await });
//! # Ok(())
//! # }
//! ```
//!
//! The worker pool itself is an external collaborator: the host process
//! supplies a [`PoolFactory`], and the gateway owns the resulting pool for
//! its lifetime (`RR_MODE=grpc` is injected into every worker's
//! environment).

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod health;
pub mod interceptor;
pub mod metrics;
pub mod pool;
pub mod proto;
pub mod proxy;
pub mod server;
mod tls;

pub use codec::{RawCodec, RawMessage};
pub use config::{ClientAuthType, Config, ConfigError, PoolConfig, TlsConfig};
pub use descriptor::{LoadedServices, MethodDescriptor, ServiceDescriptor};
pub use health::{HealthService, HealthState};
pub use interceptor::{Next, UnaryHandler, UnaryInterceptor, UnaryServerInfo};
pub use metrics::GatewayMetrics;
pub use pool::{
    Payload, PayloadCodec, Pool, PoolError, PoolFactory, ReplyReceiver, WorkerInfo, WorkerState,
};
pub use proto::health::ServingStatus;
pub use server::{Gateway, GatewayError};
