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

//! Unary interceptor chain.
//!
//! Interceptors wrap every dispatched call, outermost first: the built-in
//! telemetry interceptor runs before any user-registered ones, and the
//! innermost continuation is the worker dispatch itself. The shape follows
//! chained unary server interceptors: each layer receives the request, the
//! call info and a [`Next`] continuation it may invoke at most once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, error};
use tonic::{Code, Request, Response, Status};

use crate::codec::RawMessage;
use crate::metrics::GatewayMetrics;

/// Identifies the RPC an interceptor invocation is serving.
#[derive(Debug, Clone)]
pub struct UnaryServerInfo {
    /// `/<package>.<Service>/<Method>`.
    pub full_method: String,
}

pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Response<RawMessage>, Status>> + Send>>;

/// The innermost handler of a chain: dispatches the request to a worker.
pub type UnaryHandler = Arc<dyn Fn(Request<RawMessage>) -> HandlerFuture + Send + Sync>;

/// A named interceptor around unary calls.
///
/// Names are unique per gateway: registering an interceptor under an already
/// used name replaces the earlier one.
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn call(
        &self,
        request: Request<RawMessage>,
        info: &UnaryServerInfo,
        next: Next,
    ) -> Result<Response<RawMessage>, Status>;
}

/// Continuation of an interceptor chain.
pub struct Next {
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    index: usize,
    info: Arc<UnaryServerInfo>,
    handler: UnaryHandler,
}

impl Next {
    pub fn new(
        interceptors: Vec<Arc<dyn UnaryInterceptor>>,
        info: Arc<UnaryServerInfo>,
        handler: UnaryHandler,
    ) -> Self {
        Next {
            interceptors,
            index: 0,
            info,
            handler,
        }
    }

    /// Runs the rest of the chain with the given request.
    pub fn run(mut self, request: Request<RawMessage>) -> HandlerFuture {
        if self.index < self.interceptors.len() {
            let interceptor = self.interceptors[self.index].clone();
            self.index += 1;
            let info = self.info.clone();
            Box::pin(async move { interceptor.call(request, &info, self).await })
        } else {
            (self.handler)(request)
        }
    }
}

/// Canonical gRPC status code names, as used in metric labels.
pub(crate) fn code_str(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Built-in telemetry interceptor; always the outermost link of the chain.
pub struct TelemetryInterceptor {
    metrics: Arc<GatewayMetrics>,
}

impl TelemetryInterceptor {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        TelemetryInterceptor { metrics }
    }
}

#[async_trait]
impl UnaryInterceptor for TelemetryInterceptor {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn call(
        &self,
        request: Request<RawMessage>,
        info: &UnaryServerInfo,
        next: Next,
    ) -> Result<Response<RawMessage>, Status> {
        let start = Instant::now();
        self.metrics.queue_size.inc();

        let result = next.run(request).await;

        let code = match &result {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };
        self.metrics
            .request_counter
            .with_label_values(&[&info.full_method, code_str(code)])
            .inc();
        self.metrics
            .request_duration
            .with_label_values(&[&info.full_method])
            .observe(start.elapsed().as_secs_f64());
        self.metrics.queue_size.dec();

        match &result {
            Ok(_) => debug!(
                "method was called successfully; method: {}, elapsed: {}ms",
                info.full_method,
                start.elapsed().as_millis()
            ),
            Err(status) => error!(
                "method call was finished with error; method: {}, error: {}, elapsed: {}ms",
                info.full_method,
                status,
                start.elapsed().as_millis()
            ),
        }

        result
    }
}
