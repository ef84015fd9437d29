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

//! Per-service proxy and the worker dispatch pipeline.
//!
//! A [`ServiceProxy`] exposes one proxied service on the gRPC server without
//! static knowledge of its message types: the service descriptor is
//! synthesized at startup, every method routes through the same handler, and
//! payloads cross the proxy as opaque bytes. Each unary call becomes a worker
//! job: the request metadata is folded into a JSON context document, the
//! job is submitted to the pool, and the single reply envelope is decoded
//! back into gRPC headers, trailers and status.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use base64::{prelude::BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use http_body::Frame;
use log::{debug, error, warn};
use opentelemetry::global::BoxedTracer;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use pin_project_lite::pin_project;
use prost::Message;
use serde::Serialize;
use tonic::body::BoxBody;
use tonic::codegen::{empty_body, Body, BoxFuture, Service, StdError};
use tonic::metadata::{Ascii, KeyAndValueRef, KeyRef, MetadataKey, MetadataMap, MetadataValue};
use tonic::server::{Grpc, UnaryService};
use tonic::{Code, Request, Response, Status};

use crate::codec::{RawCodec, RawMessage};
use crate::descriptor::ServiceDescriptor;
use crate::interceptor::{Next, UnaryHandler, UnaryInterceptor, UnaryServerInfo};
use crate::pool::{Payload, PayloadCodec, PoolError, STREAM};
use crate::proto::rpc;
use crate::server::SharedState;

/// Pseudo-header carrying the client socket address to the worker.
const PEER_ADDR: &str = ":peer.address";
/// Pseudo-header carrying the transport authentication kind to the worker.
const PEER_AUTH_TYPE: &str = ":peer.auth-type";
/// Separator of the encoded-status error convention
/// (`<code>|:|<message>|:|<detail>...`).
const DELIMITER: &str = "|:|";
const API_ERR: &str = "error";
const HEADERS: &str = "headers";
const TRAILERS: &str = "trailers";

/// Trailers-only gRPC response with code `Unimplemented`; the answer for
/// unknown methods, mirroring generated-server fallbacks.
pub(crate) fn unimplemented_response() -> http::Response<BoxBody> {
    http::Response::builder()
        .status(200)
        .header("grpc-status", "12")
        .header("content-type", "application/grpc")
        .body(empty_body())
        .unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodKind {
    Unary,
    /// Declared streaming in the descriptor. Registered for completeness but
    /// answered with `Unimplemented`; workers only take unary jobs.
    Streaming,
}

/// Pieces of the gateway every proxy shares.
pub(crate) struct ProxyContext {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) telemetry: Arc<dyn UnaryInterceptor>,
    pub(crate) propagator: Arc<dyn TextMapPropagator + Send + Sync>,
    pub(crate) tracer: Arc<BoxedTracer>,
    pub(crate) max_recv_bytes: usize,
    pub(crate) max_send_bytes: usize,
}

struct ProxyInner {
    /// Fully-qualified service name.
    name: String,
    methods: HashMap<String, MethodKind>,
    context: Arc<ProxyContext>,
    payloads: PayloadPool,
}

/// Catch-all handler for one proxied service. Stateless per call.
#[derive(Clone)]
pub struct ServiceProxy {
    inner: Arc<ProxyInner>,
}

impl ServiceProxy {
    pub(crate) fn new(descriptor: &ServiceDescriptor, context: Arc<ProxyContext>) -> Self {
        let methods = descriptor
            .methods
            .iter()
            .map(|method| {
                let kind = if method.is_unary() {
                    MethodKind::Unary
                } else {
                    MethodKind::Streaming
                };
                (method.name.clone(), kind)
            })
            .collect();

        ServiceProxy {
            inner: Arc::new(ProxyInner {
                name: descriptor.full_name(),
                methods,
                context,
                payloads: PayloadPool::new(),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.name
    }
}

impl<B> Service<http::Request<B>> for ServiceProxy
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        let method = req
            .uri()
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let kind = inner.methods.get(&method).copied();
        match kind {
            Some(MethodKind::Unary) => {
                let max_recv = inner.context.max_recv_bytes;
                let max_send = inner.context.max_send_bytes;
                Box::pin(async move {
                    let handler = MethodHandler { inner, method };
                    let mut grpc = Grpc::new(RawCodec::default())
                        .apply_max_message_size_config(Some(max_recv), Some(max_send));
                    let mut response = grpc.unary(handler, req).await;
                    if let Some(WorkerTrailers(trailers)) =
                        response.extensions_mut().remove::<WorkerTrailers>()
                    {
                        response = attach_worker_trailers(response, trailers);
                    }
                    Ok(response)
                })
            }
            Some(MethodKind::Streaming) => {
                debug!(
                    "streaming method invoked on worker-backed service; service: {}, method: {}",
                    inner.name, method
                );
                Box::pin(async move { Ok(unimplemented_response()) })
            }
            None => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}

/// Runs the interceptor chain around a single dispatch.
struct MethodHandler {
    inner: Arc<ProxyInner>,
    method: String,
}

impl UnaryService<RawMessage> for MethodHandler {
    type Response = RawMessage;
    type Future = BoxFuture<Response<RawMessage>, Status>;

    fn call(&mut self, request: Request<RawMessage>) -> Self::Future {
        let inner = self.inner.clone();
        let method = self.method.clone();

        Box::pin(async move {
            let info = Arc::new(UnaryServerInfo {
                full_method: format!("/{}/{}", inner.name, method),
            });

            // Interceptor collection is serialized by the gateway lock; the
            // snapshot keeps the set stable for the duration of the call.
            let user = {
                let state = inner.context.shared.state.read().await;
                state.interceptors.clone()
            };
            let mut chain = Vec::with_capacity(user.len() + 1);
            chain.push(inner.context.telemetry.clone());
            chain.extend(user);

            let dispatch_inner = inner.clone();
            let dispatch_method = method.clone();
            let handler: UnaryHandler = Arc::new(move |request| {
                let inner = dispatch_inner.clone();
                let method = dispatch_method.clone();
                Box::pin(async move { dispatch(inner, method, request).await })
            });

            Next::new(chain, info, handler).run(request).await
        })
    }
}

/// The request-dispatch pipeline: context assembly, pool submission, reply
/// decoding.
async fn dispatch(
    inner: Arc<ProxyInner>,
    method: String,
    request: Request<RawMessage>,
) -> Result<Response<RawMessage>, Status> {
    let full_method = format!("/{}/{}", inner.name, method);

    let parent_cx = inner
        .context
        .propagator
        .extract(&MetadataExtractor(request.metadata()));
    let span = inner
        .context
        .tracer
        .span_builder(full_method)
        .with_kind(SpanKind::Server)
        .start_with_context(inner.context.tracer.as_ref(), &parent_cx);
    let cx = parent_cx.with_span(span);

    let mut context_map: HashMap<String, Vec<String>> = HashMap::new();
    inner
        .context
        .propagator
        .inject_context(&cx, &mut MultimapInjector(&mut context_map));
    merge_incoming_metadata(&mut context_map, request.metadata());
    // Gateway-generated pseudo-headers overwrite anything the client sent
    // under the same keys.
    if let Some(addr) = request.remote_addr() {
        context_map.insert(PEER_ADDR.to_string(), vec![addr.to_string()]);
    }
    if request.peer_certs().is_some() {
        context_map.insert(PEER_AUTH_TYPE.to_string(), vec!["tls".to_string()]);
    }

    let context_bytes = serde_json::to_vec(&RpcContext {
        service: &inner.name,
        method: &method,
        context: &context_map,
    })
    .map_err(|err| Status::internal(format!("failed to encode dispatch context: {err}")))?;

    let mut payload = inner.payloads.get();
    payload.context = Bytes::from(context_bytes);
    payload.body = request.into_inner().into_bytes();

    let result = exec_and_decode(&inner, &payload).await;
    inner.payloads.put(payload);

    if let Err(status) = &result {
        cx.span()
            .set_status(opentelemetry::trace::Status::error(
                status.message().to_string(),
            ));
    }
    cx.span().end();

    result
}

async fn exec_and_decode(
    inner: &Arc<ProxyInner>,
    payload: &Payload,
) -> Result<Response<RawMessage>, Status> {
    // The read lock serializes dispatch against Reset/Stop, which hold the
    // write side while swapping workers.
    let receiver = {
        let state = inner.context.shared.state.read().await;
        let pool = state
            .pool
            .as_ref()
            .ok_or_else(|| Status::unavailable("worker pool is not running"))?;
        pool.exec(payload).await.map_err(|err| wrap_error(&err))?
    };

    let reply = match receiver.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => return Err(wrap_error(&err)),
        // Channel closed without a value: the worker died mid-job.
        Err(_) => return Err(Status::internal("worker empty response")),
    };

    if reply.flags & STREAM != 0 {
        return Err(Status::internal("streaming is not supported"));
    }

    let metadata = response_metadata(&reply.context)?;

    if let Some((status, raw)) = metadata.error {
        if status.code != Code::Ok as i32 {
            // Headers and trailers still reach the client; on the failure
            // path they ride the status metadata (errors are trailers-only
            // responses on the wire).
            let mut combined = metadata.headers;
            merge_metadata(&mut combined, metadata.trailers);
            return Err(Status::with_details_and_metadata(
                Code::from_i32(status.code),
                status.message,
                Bytes::from(raw),
                combined,
            ));
        }
    }

    let mut response = Response::new(RawMessage::from(reply.body));
    *response.metadata_mut() = metadata.headers;
    if !metadata.trailers.is_empty() {
        response.extensions_mut().insert(WorkerTrailers(metadata.trailers));
    }
    Ok(response)
}

/// RPC metadata decoded from a worker reply envelope.
#[derive(Debug)]
struct ResponseMetadata {
    headers: MetadataMap,
    trailers: MetadataMap,
    /// Decoded `google.rpc.Status` plus its raw serialized form.
    error: Option<(rpc::Status, Vec<u8>)>,
}

fn response_metadata(context: &[u8]) -> Result<ResponseMetadata, Status> {
    let mut out = ResponseMetadata {
        headers: MetadataMap::new(),
        trailers: MetadataMap::new(),
        error: None,
    };
    if context.is_empty() {
        return Ok(out);
    }

    let map: HashMap<String, String> = serde_json::from_slice(context)
        .map_err(|err| Status::internal(format!("malformed worker context: {err}")))?;
    if map.is_empty() {
        return Ok(out);
    }

    if !map.contains_key(HEADERS) && !map.contains_key(TRAILERS) {
        // Old worker API: the whole document is header metadata.
        for (key, value) in &map {
            append_pair(&mut out.headers, key, value);
        }
    } else {
        if let Some(raw) = map.get(HEADERS) {
            decode_metadata_object(raw, &mut out.headers, HEADERS);
        }
        if let Some(raw) = map.get(TRAILERS) {
            decode_metadata_object(raw, &mut out.trailers, TRAILERS);
        }
    }

    if let Some(encoded) = map.get(API_ERR) {
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| Status::internal(format!("malformed worker error envelope: {err}")))?;
        let status = rpc::Status::decode(raw.as_slice())
            .map_err(|err| Status::internal(format!("malformed worker error envelope: {err}")))?;
        out.error = Some((status, raw));
    }

    Ok(out)
}

/// Decodes one `headers`/`trailers` JSON object into metadata pairs. String
/// values pass through, integers are stringified, anything else is skipped.
fn decode_metadata_object(raw: &str, target: &mut MetadataMap, kind: &str) {
    let object: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(raw) {
        Ok(object) => object,
        Err(err) => {
            error!("error unmarshalling {kind}: {err}");
            return;
        }
    };

    for (key, value) in object {
        match value {
            serde_json::Value::String(text) => append_pair(target, &key, &text),
            serde_json::Value::Number(number) if number.is_i64() || number.is_u64() => {
                append_pair(target, &key, &number.to_string());
            }
            other => warn!(
                "skipping {kind} entry with unsupported type; key: {key}, value: {other}"
            ),
        }
    }
}

fn append_pair(target: &mut MetadataMap, key: &str, value: &str) {
    let key = match key.parse::<MetadataKey<Ascii>>() {
        Ok(key) => key,
        Err(_) => {
            warn!("skipping metadata entry with invalid key: {key}");
            return;
        }
    };
    let value = match value.parse::<MetadataValue<Ascii>>() {
        Ok(value) => value,
        Err(_) => {
            warn!("skipping metadata entry with invalid value; key: {key}");
            return;
        }
    };
    target.append(key, value);
}

fn merge_metadata(target: &mut MetadataMap, source: MetadataMap) {
    if source.is_empty() {
        return;
    }
    let mut headers = std::mem::take(target).into_headers();
    headers.extend(source.into_headers());
    *target = MetadataMap::from_headers(headers);
}

/// Translates a pool failure into a gRPC status.
///
/// Workers may encode a specific status as
/// `<code>|:|<message>|:|<detail>...` where details are serialized
/// `google.protobuf.Any` messages; everything else becomes `Internal`.
pub(crate) fn wrap_error(err: &PoolError) -> Status {
    let message = err.to_string();
    match decode_error_string(&message) {
        Some(status) => status,
        None => Status::internal(message),
    }
}

fn decode_error_string(message: &str) -> Option<Status> {
    if !message.contains(DELIMITER) {
        return None;
    }
    let chunks: Vec<&str> = message.split(DELIMITER).collect();
    if chunks.len() < 2 {
        return None;
    }

    let parsed: u64 = chunks[0].parse().ok()?;
    let code = if parsed > 0 && parsed < u32::MAX as u64 {
        parsed as i32
    } else {
        Code::Internal as i32
    };

    let mut status = rpc::Status {
        code,
        message: chunks[1].to_string(),
        details: Vec::new(),
    };
    for chunk in &chunks[2..] {
        if let Ok(detail) = prost_types::Any::decode(chunk.as_bytes()) {
            status.details.push(detail);
        }
    }

    Some(status_from_proto(status))
}

/// Returns the worker-provided `google.rpc.Status` to the client verbatim,
/// details included.
pub(crate) fn status_from_proto(status: rpc::Status) -> Status {
    let code = Code::from_i32(status.code);
    let message = status.message.clone();
    let details = status.encode_to_vec();
    Status::with_details(code, message, Bytes::from(details))
}

/// Worker-provided trailers travel from the dispatch to the proxy through
/// response extensions, then onto the HTTP/2 trailers frame.
#[derive(Clone)]
struct WorkerTrailers(MetadataMap);

fn attach_worker_trailers(
    response: http::Response<BoxBody>,
    trailers: MetadataMap,
) -> http::Response<BoxBody> {
    let (parts, body) = response.into_parts();
    let body = WithTrailers {
        inner: body,
        trailers: Some(trailers.into_headers()),
    };
    http::Response::from_parts(parts, BoxBody::new(body))
}

pin_project! {
    /// Body adapter that folds extra fields into the stream's trailers frame
    /// (or appends one if the inner body never produces trailers).
    struct WithTrailers<B> {
        #[pin]
        inner: B,
        trailers: Option<http::HeaderMap>,
    }
}

impl<B> Body for WithTrailers<B>
where
    B: Body<Data = Bytes, Error = Status>,
{
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        let this = self.project();
        match std::task::ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => match frame.into_trailers() {
                Ok(mut inner_trailers) => {
                    if let Some(extra) = this.trailers.take() {
                        inner_trailers.extend(extra);
                    }
                    Poll::Ready(Some(Ok(Frame::trailers(inner_trailers))))
                }
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => match this.trailers.take() {
                Some(extra) => Poll::Ready(Some(Ok(Frame::trailers(extra)))),
                None => Poll::Ready(None),
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.trailers.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Envelopes are reused across calls to amortize allocation; cleared before
/// returning to the free list. Never shared between in-flight calls.
struct PayloadPool {
    free: Mutex<Vec<Payload>>,
}

impl PayloadPool {
    fn new() -> Self {
        PayloadPool {
            free: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Payload {
        let mut payload = self.free.lock().unwrap().pop().unwrap_or_default();
        payload.codec = PayloadCodec::Json;
        payload
    }

    fn put(&self, mut payload: Payload) {
        payload.flags = 0;
        payload.context = Bytes::new();
        payload.body = Bytes::new();
        self.free.lock().unwrap().push(payload);
    }
}

/// The outbound context document handed to workers.
#[derive(Serialize)]
struct RpcContext<'a> {
    service: &'a str,
    method: &'a str,
    context: &'a HashMap<String, Vec<String>>,
}

fn merge_incoming_metadata(context: &mut HashMap<String, Vec<String>>, metadata: &MetadataMap) {
    let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
    for entry in metadata.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if let Ok(value) = value.to_str() {
                    incoming
                        .entry(key.as_str().to_string())
                        .or_default()
                        .push(value.to_string());
                }
            }
            KeyAndValueRef::Binary(key, value) => match value.to_bytes() {
                Ok(bytes) => incoming
                    .entry(key.as_str().to_string())
                    .or_default()
                    .push(BASE64_STANDARD.encode(bytes)),
                Err(err) => debug!(
                    "skipping malformed binary metadata; key: {}, error: {}",
                    key.as_str(),
                    err
                ),
            },
        }
    }
    // Client metadata replaces injected values key by key.
    context.extend(incoming);
}

struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                KeyRef::Ascii(key) => key.as_str(),
                KeyRef::Binary(key) => key.as_str(),
            })
            .collect()
    }
}

struct MultimapInjector<'a>(&'a mut HashMap<String, Vec<String>>);

impl Injector for MultimapInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), vec![value]);
    }
}
