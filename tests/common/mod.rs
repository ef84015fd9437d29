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

//! Test fixtures: an in-process worker pool, a gateway harness and dynamic
//! gRPC client helpers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use grpc_gateway::proto::health::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use grpc_gateway::{
    Gateway, GatewayError, Payload, Pool, PoolConfig, PoolError, PoolFactory, RawCodec,
    RawMessage, ReplyReceiver, WorkerInfo, WorkerState,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status, Streaming};

pub const ECHO_PROTO: &str = r#"syntax = "proto3";

package service;

service Echo {
    rpc Ping (Message) returns (Message) {}
    rpc Subscribe (Message) returns (stream Message) {}
}

message Message {
    string msg = 1;
}
"#;

pub const PING_PATH: &str = "/service.Echo/Ping";

/// Synchronous job handler standing in for a worker process.
pub type Handler = Arc<dyn Fn(&Payload) -> Result<Payload, PoolError> + Send + Sync>;

/// Worker reply with response bytes only.
pub fn echo_handler() -> Handler {
    Arc::new(|payload| {
        Ok(Payload {
            body: payload.body.clone(),
            ..Payload::default()
        })
    })
}

/// Worker reply echoing the dispatch context document as the body, so tests
/// can inspect what the gateway sent.
pub fn context_echo_handler() -> Handler {
    Arc::new(|payload| {
        Ok(Payload {
            body: payload.context.clone(),
            ..Payload::default()
        })
    })
}

/// Worker reply with a fixed metadata context.
pub fn metadata_handler(context: serde_json::Value) -> Handler {
    let context = Bytes::from(context.to_string());
    Arc::new(move |payload| {
        Ok(Payload {
            context: context.clone(),
            body: payload.body.clone(),
            ..Payload::default()
        })
    })
}

pub struct FakePool {
    handler: Handler,
    generation: Arc<AtomicU64>,
    reset_delay: Duration,
}

#[async_trait]
impl Pool for FakePool {
    fn workers(&self) -> Vec<WorkerInfo> {
        vec![WorkerInfo {
            pid: 100 + self.generation.load(Ordering::SeqCst) as u32,
            state: WorkerState::Ready,
            memory_bytes: 1 << 20,
        }]
    }

    async fn exec(&self, payload: &Payload) -> Result<ReplyReceiver, PoolError> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send((self.handler)(payload));
        Ok(rx)
    }

    async fn reset(&self) -> Result<(), PoolError> {
        // A real pool respawns processes; keep the window observable.
        tokio::time::sleep(self.reset_delay).await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) {}
}

pub struct FakeFactory {
    handler: Handler,
    reset_delay: Duration,
    pub pools_created: AtomicU64,
    pub env_seen: Mutex<HashMap<String, String>>,
}

impl FakeFactory {
    pub fn new(handler: Handler, reset_delay: Duration) -> Self {
        FakeFactory {
            handler,
            reset_delay,
            pools_created: AtomicU64::new(0),
            env_seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PoolFactory for FakeFactory {
    async fn new_pool(
        &self,
        _config: &PoolConfig,
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn Pool>, PoolError> {
        self.pools_created.fetch_add(1, Ordering::SeqCst);
        *self.env_seen.lock().unwrap() = env.clone();
        Ok(Arc::new(FakePool {
            handler: self.handler.clone(),
            generation: Arc::new(AtomicU64::new(0)),
            reset_delay: self.reset_delay,
        }))
    }
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub factory: Arc<FakeFactory>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<Result<(), GatewayError>>,
    // Keeps the on-disk proto alive for the server's lifetime.
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
}

pub async fn serve_gateway(handler: Handler) -> TestGateway {
    serve_gateway_with(handler, Duration::ZERO, "").await
}

pub async fn serve_gateway_with(
    handler: Handler,
    reset_delay: Duration,
    extra_toml: &str,
) -> TestGateway {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let proto_path = dir.path().join("echo.proto");
    std::fs::write(&proto_path, ECHO_PROTO).unwrap();

    let raw = format!(
        "[grpc]\nlisten = \"127.0.0.1:0\"\nproto = [\"{}\"]\n{}",
        proto_path.display(),
        extra_toml
    );

    let factory = Arc::new(FakeFactory::new(handler, reset_delay));
    let pool_factory: Arc<dyn PoolFactory> = factory.clone();
    let gateway = Arc::new(Gateway::from_toml_str(&raw, pool_factory).unwrap());

    let serving = gateway.clone();
    let handle = tokio::spawn(async move { serving.serve().await });

    let addr = wait_for_addr(&gateway).await;
    TestGateway {
        gateway,
        factory,
        addr,
        handle,
        dir,
    }
}

async fn wait_for_addr(gateway: &Gateway) -> SocketAddr {
    for _ in 0..200 {
        if let Some(addr) = gateway.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gateway did not bind in time");
}

pub async fn connect(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

/// Unary call through the passthrough codec, the way a client of an unknown
/// service would be driven.
pub async fn raw_unary(
    channel: Channel,
    path: &str,
    body: Vec<u8>,
    metadata: &[(&str, &str)],
) -> Result<Response<RawMessage>, Status> {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|err| Status::unknown(format!("service not ready: {err}")))?;

    let mut request = Request::new(RawMessage::from(body));
    for (key, value) in metadata {
        let key: tonic::metadata::MetadataKey<tonic::metadata::Ascii> = key.parse().unwrap();
        request.metadata_mut().insert(key, value.parse().unwrap());
    }

    let path = http::uri::PathAndQuery::try_from(path.to_string()).unwrap();
    grpc.unary(request, path, RawCodec::default()).await
}

pub async fn health_check(channel: Channel) -> ServingStatus {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.unwrap();

    let codec: ProstCodec<HealthCheckRequest, HealthCheckResponse> = ProstCodec::default();
    let response = grpc
        .unary(
            Request::new(HealthCheckRequest {
                service: String::new(),
            }),
            http::uri::PathAndQuery::from_static("/grpc.health.v1.Health/Check"),
            codec,
        )
        .await
        .unwrap();

    ServingStatus::try_from(response.into_inner().status).unwrap()
}

pub async fn health_watch(channel: Channel) -> Streaming<HealthCheckResponse> {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.unwrap();

    let codec: ProstCodec<HealthCheckRequest, HealthCheckResponse> = ProstCodec::default();
    grpc.server_streaming(
        Request::new(HealthCheckRequest {
            service: String::new(),
        }),
        http::uri::PathAndQuery::from_static("/grpc.health.v1.Health/Watch"),
        codec,
    )
    .await
    .unwrap()
    .into_inner()
}

pub async fn next_watch_status(stream: &mut Streaming<HealthCheckResponse>) -> ServingStatus {
    let response = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("watch produced no value in time")
        .expect("watch stream failed")
        .expect("watch stream ended");
    ServingStatus::try_from(response.status).unwrap()
}
