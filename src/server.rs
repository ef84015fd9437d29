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

//! Gateway lifecycle: boot, serve, stop, reset.
//!
//! [`Gateway::serve`] builds the worker pool, synthesizes a proxy per
//! declared service, mounts them together with the health (and optionally
//! reflection) services, and runs the gRPC server until [`Gateway::stop`]
//! triggers a graceful drain. [`Gateway::reset`] swaps the pool's workers in
//! place while the listener stays up.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, info};
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, RwLock};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::BoxBody;
use tonic::codegen::Service;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::config::{Config, ConfigError};
use crate::descriptor::{self, DescriptorError};
use crate::health::{HealthService, HealthState, SERVICE_NAME as HEALTH_SERVICE};
use crate::interceptor::{TelemetryInterceptor, UnaryInterceptor};
use crate::metrics::{GatewayMetrics, WorkersSource};
use crate::pool::{Pool, PoolError, PoolFactory, WorkerInfo};
use crate::proto::health::ServingStatus;
use crate::proxy::{unimplemented_response, ProxyContext, ServiceProxy};
use crate::tls;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("service '{0}' is registered more than once")]
    DuplicateService(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("reflection registry error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
    #[error("gateway stop deadline exceeded")]
    StopTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) struct GatewayState {
    pub(crate) pool: Option<Arc<dyn Pool>>,
    pub(crate) interceptors: Vec<Arc<dyn UnaryInterceptor>>,
}

/// State guarded by the single gateway lock: dispatch takes the read side
/// around pool submission, Stop/Reset/interceptor registration take the
/// write side.
pub(crate) struct SharedState {
    pub(crate) state: RwLock<GatewayState>,
}

impl WorkersSource for SharedState {
    fn workers(&self) -> Vec<WorkerInfo> {
        // Scrapes must not block behind Reset/Stop; report nothing while the
        // write side is held.
        match self.state.try_read() {
            Ok(state) => state
                .pool
                .as_ref()
                .map(|pool| pool.workers())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

/// The gRPC gateway.
pub struct Gateway {
    config: Config,
    factory: Arc<dyn PoolFactory>,
    shared: Arc<SharedState>,
    health: Arc<HealthState>,
    metrics: Arc<GatewayMetrics>,
    telemetry: Arc<dyn UnaryInterceptor>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    tracer: Arc<BoxedTracer>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    done: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Gateway {
    /// Builds a gateway from an already parsed configuration. Validation and
    /// defaulting run here, so direct construction behaves like
    /// [`Gateway::from_toml_str`].
    pub fn new(mut config: Config, factory: Arc<dyn PoolFactory>) -> Result<Gateway, ConfigError> {
        config.init_defaults()?;

        let shared = Arc::new(SharedState {
            state: RwLock::new(GatewayState {
                pool: None,
                interceptors: Vec::new(),
            }),
        });

        let metrics = Arc::new(GatewayMetrics::new());
        let source: Arc<dyn WorkersSource> = shared.clone();
        metrics.register_worker_collector(Arc::downgrade(&source));

        let telemetry: Arc<dyn UnaryInterceptor> =
            Arc::new(TelemetryInterceptor::new(metrics.clone()));

        Ok(Gateway {
            config,
            factory,
            shared,
            health: Arc::new(HealthState::new()),
            metrics,
            telemetry,
            propagator: default_propagator(),
            tracer: Arc::new(opentelemetry::global::tracer("grpc-gateway")),
            shutdown: Mutex::new(None),
            done: watch::channel(false).0,
            local_addr: Mutex::new(None),
        })
    }

    /// Builds a gateway from the `[grpc]` section of a TOML document.
    /// [`ConfigError::Disabled`] means the section is absent and the gateway
    /// should not start.
    pub fn from_toml_str(raw: &str, factory: Arc<dyn PoolFactory>) -> Result<Gateway, ConfigError> {
        let config = Config::from_toml_str(raw)?;
        Gateway::new(config, factory)
    }

    /// Replaces the default composite propagator (W3C trace context, baggage
    /// and Jaeger).
    pub fn with_propagator(
        mut self,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        self.propagator = Arc::new(propagator);
        self
    }

    /// Replaces the tracer used for the per-dispatch server spans. Defaults
    /// to the globally installed provider.
    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Registers a named unary interceptor; an interceptor registered under
    /// an existing name replaces it in place.
    pub async fn register_interceptor(&self, interceptor: Arc<dyn UnaryInterceptor>) {
        let mut state = self.shared.state.write().await;
        match state
            .interceptors
            .iter_mut()
            .find(|existing| existing.name() == interceptor.name())
        {
            Some(existing) => *existing = interceptor,
            None => state.interceptors.push(interceptor),
        }
    }

    /// Snapshot of the current worker set.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let state = self.shared.state.read().await;
        state
            .pool
            .as_ref()
            .map(|pool| pool.workers())
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.metrics.clone()
    }

    pub fn serving_status(&self) -> ServingStatus {
        self.health.serving_status()
    }

    /// Bound listener address, available once [`Gateway::serve`] is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Runs the gateway until [`Gateway::stop`] completes the graceful
    /// drain. Fatal boot problems (pool allocation, descriptor loading,
    /// binding, TLS material) surface as the returned error.
    pub async fn serve(&self) -> Result<(), GatewayError> {
        let pool = self
            .factory
            .new_pool(&self.config.pool, &self.config.env)
            .await?;
        {
            let mut state = self.shared.state.write().await;
            state.pool = Some(pool);
        }

        let loaded = descriptor::load_services(&self.config)?;

        let proxy_context = Arc::new(ProxyContext {
            shared: self.shared.clone(),
            telemetry: self.telemetry.clone(),
            propagator: self.propagator.clone(),
            tracer: self.tracer.clone(),
            max_recv_bytes: self.config.max_recv_bytes(),
            max_send_bytes: self.config.max_send_bytes(),
        });

        let mut router = axum::Router::new().fallback_service(UnimplementedService);

        let mut seen = HashSet::new();
        for service in &loaded.services {
            let full_name = service.full_name();
            if !seen.insert(full_name.clone()) {
                return Err(GatewayError::DuplicateService(full_name));
            }
            let proxy = ServiceProxy::new(service, proxy_context.clone());
            info!(
                "proxy service was registered; service: {}, methods: {}, source: {}",
                full_name,
                service.methods.len(),
                service.source_file
            );
            router = router.route_service(&format!("/{full_name}/*rest"), proxy);
        }

        router = router.route_service(
            &format!("/{HEALTH_SERVICE}/*rest"),
            HealthService::new(self.health.clone()),
        );

        if self.config.reflection && !loaded.descriptor_set.file.is_empty() {
            let reflection = tonic_reflection::server::Builder::configure()
                .register_file_descriptor_set(loaded.descriptor_set.clone())
                .build_v1()?;
            router = router.route_service(&service_path(&reflection), reflection);
        }

        let listener = bind_listener(&self.config.listen)?;
        *self.local_addr.lock().unwrap() = Some(listener.local_addr()?);

        let mut builder = Server::builder();
        if self.config.tls_enabled() {
            let tls_config = tls::server_tls_config(self.config.tls.as_ref().unwrap())?;
            builder = builder.tls_config(tls_config)?;
        }
        builder = builder
            .http2_keepalive_interval(self.config.ping_time)
            .http2_keepalive_timeout(self.config.timeout)
            .max_concurrent_streams(Some(self.config.max_concurrent_streams));
        if let Some(age) = self.config.max_connection_age {
            builder = builder.max_connection_age(age);
        }
        if self.config.max_connection_idle.is_some()
            || self.config.max_connection_age_grace.is_some()
        {
            debug!("max_connection_idle and max_connection_age_grace are not supported by the transport; ignoring");
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        self.done.send_replace(false);

        self.health.set_serving_status(ServingStatus::Serving);
        info!("grpc server was started; address: {}", self.config.listen);

        let result = builder
            .add_routes(Routes::from(router))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                // Sender dropped counts as a shutdown request too.
                let _ = shutdown_rx.await;
            })
            .await;

        self.done.send_replace(true);
        result?;
        Ok(())
    }

    /// Stops the gateway: flips the health status, drains the server and
    /// destroys the pool. If the deadline elapses first the error is
    /// returned while the drain keeps going in the background.
    pub async fn stop(&self, deadline: Duration) -> Result<(), GatewayError> {
        let (pool, was_serving) = {
            let mut state = self.shared.state.write().await;
            self.health.set_serving_status(ServingStatus::NotServing);
            let sender = self.shutdown.lock().unwrap().take();
            let was_serving = sender.is_some();
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
            self.health.shutdown();
            (state.pool.take(), was_serving)
        };

        let mut done = self.done.subscribe();
        let drain = tokio::spawn(async move {
            if was_serving {
                let _ = done.wait_for(|finished| *finished).await;
            }
            if let Some(pool) = pool {
                pool.destroy().await;
            }
        });

        match tokio::time::timeout(deadline, drain).await {
            Ok(_) => Ok(()),
            Err(_) => Err(GatewayError::StopTimeout),
        }
    }

    /// Replaces the pool's workers in place. The health status dips to
    /// `NOT_SERVING` for the duration and is restored afterwards no matter
    /// how the reset went.
    pub async fn reset(&self) -> Result<(), GatewayError> {
        let state = self.shared.state.write().await;
        self.health.set_serving_status(ServingStatus::NotServing);
        info!("reset signal was received");

        let result = match state.pool.as_ref() {
            Some(pool) => pool.reset().await,
            None => Ok(()),
        };

        self.health.set_serving_status(ServingStatus::Serving);
        result?;
        info!("gateway was successfully reset");
        Ok(())
    }
}

fn default_propagator() -> Arc<dyn TextMapPropagator + Send + Sync> {
    Arc::new(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ]))
}

fn service_path<S: NamedService>(_service: &S) -> String {
    format!("/{}/*rest", S::NAME)
}

/// Reuse-addr/reuse-port listener so a restarting gateway can rebind without
/// waiting out TIME_WAIT.
fn bind_listener(listen: &str) -> Result<TcpListener, GatewayError> {
    let addr = listen
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ConfigError::MalformedAddress(listen.to_string()))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Fallback for paths outside every registered service.
#[derive(Clone, Copy, Default)]
struct UnimplementedService;

impl<B> Service<http::Request<B>> for UnimplementedService
where
    B: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: http::Request<B>) -> Self::Future {
        std::future::ready(Ok(unimplemented_response()))
    }
}
