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

//! The standard gRPC health-checking service (`grpc.health.v1.Health`).
//!
//! The gateway tracks a single global serving status: `NOT_SERVING` at
//! construction, `SERVING` once the listener is up, `NOT_SERVING` again
//! around stop and reset. Watchers observe transitions through a broadcast
//! that coalesces intermediate values, so a slow watcher always sees the
//! freshest status rather than every hop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_stream::try_stream;
use log::info;
use tokio::sync::watch;
use tonic::codegen::tokio_stream::Stream;
use tonic::codegen::{Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, ServerStreamingService, UnaryService};
use tonic::{Request, Response, Status};

use crate::proto::health::{
    HealthCheckRequest, HealthCheckResponse, HealthListRequest, HealthListResponse, ServingStatus,
};
use crate::proxy::unimplemented_response;

pub use crate::proto::health::SERVICE_NAME;

/// Name the global status is listed under in `List` responses.
const LISTED_SERVICE: &str = "grpc";

struct Inner {
    status: ServingStatus,
    shutdown: bool,
}

/// The health state machine shared between the gateway lifecycle and the
/// health service.
pub struct HealthState {
    inner: Mutex<Inner>,
    sender: watch::Sender<ServingStatus>,
}

impl HealthState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ServingStatus::NotServing);
        HealthState {
            inner: Mutex::new(Inner {
                status: ServingStatus::NotServing,
                shutdown: false,
            }),
            sender,
        }
    }

    pub fn serving_status(&self) -> ServingStatus {
        self.inner.lock().unwrap().status
    }

    /// Stores and broadcasts a new status. Ignored after [`shutdown`].
    ///
    /// [`shutdown`]: HealthState::shutdown
    pub fn set_serving_status(&self, status: ServingStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            info!("health status changing is ignored, because health service is shutdown");
            return;
        }
        inner.status = status;
        // Watchers only ever read the latest value; stale intermediates are
        // overwritten rather than queued.
        self.sender.send_replace(status);
    }

    /// Terminal: no status change is published after this.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
    }

    fn subscribe(&self) -> watch::Receiver<ServingStatus> {
        self.sender.subscribe()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        HealthState::new()
    }
}

/// Stream of status transitions for a single watcher. The first value always
/// transmits; consecutive equal values are suppressed. Dropping the stream
/// (client cancellation included) deregisters the watcher.
fn watch_stream(
    mut receiver: watch::Receiver<ServingStatus>,
) -> impl Stream<Item = Result<HealthCheckResponse, Status>> + Send {
    try_stream! {
        let mut last_sent: i32 = -1;
        loop {
            let current = *receiver.borrow_and_update();
            if current as i32 != last_sent {
                last_sent = current as i32;
                yield HealthCheckResponse {
                    status: current as i32,
                };
            }
            if receiver.changed().await.is_err() {
                // Gateway state dropped; the server is shutting down.
                break;
            }
        }
    }
}

/// `grpc.health.v1.Health` service over the gateway's global status.
#[derive(Clone)]
pub struct HealthService {
    state: Arc<HealthState>,
}

impl HealthService {
    pub fn new(state: Arc<HealthState>) -> Self {
        HealthService { state }
    }
}

struct CheckSvc(Arc<HealthState>);

impl UnaryService<HealthCheckRequest> for CheckSvc {
    type Response = HealthCheckResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, _request: Request<HealthCheckRequest>) -> Self::Future {
        let state = self.0.clone();
        Box::pin(async move {
            Ok(Response::new(HealthCheckResponse {
                status: state.serving_status() as i32,
            }))
        })
    }
}

struct ListSvc(Arc<HealthState>);

impl UnaryService<HealthListRequest> for ListSvc {
    type Response = HealthListResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, _request: Request<HealthListRequest>) -> Self::Future {
        let state = self.0.clone();
        Box::pin(async move {
            let mut statuses = HashMap::new();
            statuses.insert(
                LISTED_SERVICE.to_string(),
                HealthCheckResponse {
                    status: state.serving_status() as i32,
                },
            );
            Ok(Response::new(HealthListResponse { statuses }))
        })
    }
}

struct WatchSvc(Arc<HealthState>);

impl ServerStreamingService<HealthCheckRequest> for WatchSvc {
    type Response = HealthCheckResponse;
    type ResponseStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;
    type Future = BoxFuture<Response<Self::ResponseStream>, Status>;

    fn call(&mut self, _request: Request<HealthCheckRequest>) -> Self::Future {
        let receiver = self.0.subscribe();
        Box::pin(async move {
            let stream = watch_stream(receiver);
            Ok(Response::new(Box::pin(stream) as Self::ResponseStream))
        })
    }
}

impl<B> Service<http::Request<B>> for HealthService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let state = self.state.clone();
        match req.uri().path() {
            "/grpc.health.v1.Health/Check" => Box::pin(async move {
                let codec = tonic::codec::ProstCodec::default();
                let mut grpc = Grpc::new(codec);
                Ok(grpc.unary(CheckSvc(state), req).await)
            }),
            "/grpc.health.v1.Health/Watch" => Box::pin(async move {
                let codec = tonic::codec::ProstCodec::default();
                let mut grpc = Grpc::new(codec);
                Ok(grpc.server_streaming(WatchSvc(state), req).await)
            }),
            "/grpc.health.v1.Health/List" => Box::pin(async move {
                let codec = tonic::codec::ProstCodec::default();
                let mut grpc = Grpc::new(codec);
                Ok(grpc.unary(ListSvc(state), req).await)
            }),
            _ => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}
