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

//! The worker-pool contract.
//!
//! The gateway does not manage worker processes itself; it submits jobs to an
//! externally supplied [`Pool`] and awaits exactly one reply per job. The
//! unit of exchange is the [`Payload`] envelope: a JSON context document plus
//! an opaque body.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::PoolConfig;

/// Reply flag bit: the worker is answering with a stream fragment. Unary
/// replies must keep it clear.
pub const STREAM: u8 = 0x01;

/// Encoding of the envelope context document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PayloadCodec {
    #[default]
    Raw = 0,
    Json = 1,
}

/// The IPC message unit exchanged with workers.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub flags: u8,
    pub codec: PayloadCodec,
    /// JSON context document (request route and metadata on the way out, RPC
    /// metadata on the way back).
    pub context: Bytes,
    /// Opaque message bytes, never parsed by the gateway.
    pub body: Bytes,
}

/// Worker process state as observed by diagnostics and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Working,
    /// Killing, destroyed, errored or otherwise unusable.
    Invalid,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Ready => "ready",
            WorkerState::Working => "working",
            WorkerState::Invalid => "invalid",
        }
    }
}

/// Point-in-time snapshot of a single worker process.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub pid: u32,
    pub state: WorkerState,
    pub memory_bytes: u64,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Failure reported by the worker that executed the job. The message may
    /// carry an encoded gRPC status (see the dispatch pipeline).
    #[error("{0}")]
    Worker(String),
    /// The pool itself could not admit, route or complete the job.
    #[error("{0}")]
    Pool(String),
}

/// Channel on which the pool delivers the single reply for a submitted job.
///
/// A oneshot receiver makes "at most one reply per dispatch" structural: a
/// pool cannot yield a second value. Dropping the sender without a value
/// signals a broken worker.
pub type ReplyReceiver = oneshot::Receiver<Result<Payload, PoolError>>;

/// A pool of external worker processes.
///
/// Implementations own admission control, supervision and transport framing;
/// the gateway only submits envelopes and observes worker state.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Snapshot of the workers currently associated with the pool.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Submit a job. May suspend on admission control. The returned channel
    /// yields exactly one reply envelope.
    async fn exec(&self, payload: &Payload) -> Result<ReplyReceiver, PoolError>;

    /// Replace every worker with a fresh one, letting in-flight jobs finish.
    async fn reset(&self) -> Result<(), PoolError>;

    /// Tear the pool down, letting in-flight jobs finish.
    async fn destroy(&self);
}

/// Creates worker pools for the gateway. Supplied by the host process.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn new_pool(
        &self,
        config: &PoolConfig,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn Pool>, PoolError>;
}
