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

//! End-to-end tests: a real gRPC client against a gateway backed by an
//! in-process worker pool.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::{prelude::BASE64_STANDARD, Engine as _};
use grpc_gateway::config::{GRPC_MODE, RR_MODE};
use grpc_gateway::proto::health::ServingStatus;
use grpc_gateway::proto::rpc;
use grpc_gateway::{Payload, PoolError};
use prost::Message;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};
use tonic::Code;

use common::*;

fn counter_value(
    families: &[prometheus::proto::MetricFamily],
    name: &str,
    labels: &[(&str, &str)],
) -> Option<u64> {
    let family = families.iter().find(|f| f.get_name() == name)?;
    'metric: for metric in family.get_metric() {
        for (key, value) in labels {
            let found = metric
                .get_label()
                .iter()
                .any(|l| l.get_name() == *key && l.get_value() == *value);
            if !found {
                continue 'metric;
            }
        }
        return Some(metric.get_counter().get_value() as u64);
    }
    None
}

#[tokio::test]
async fn echo_roundtrip_and_counters() {
    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;

    let body = br#"{"msg":"TOST"}"#.to_vec();
    let response = raw_unary(channel, PING_PATH, body.clone(), &[])
        .await
        .unwrap();
    assert_eq!(response.into_inner().as_ref(), body.as_slice());

    let families = server.gateway.metrics().gather();
    let count = counter_value(
        &families,
        "grpc_gateway_request_total",
        &[("method", PING_PATH), ("status", "OK")],
    );
    assert_eq!(count, Some(1));
}

#[tokio::test]
async fn worker_error_string_maps_to_status() {
    let handler: Handler =
        std::sync::Arc::new(|_| Err(PoolError::Worker("13|:|FOOOOOOOOOOOO".to_string())));
    let server = serve_gateway(handler).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "FOOOOOOOOOOOO");

    let families = server.gateway.metrics().gather();
    let count = counter_value(
        &families,
        "grpc_gateway_request_total",
        &[("method", PING_PATH), ("status", "Internal")],
    );
    assert_eq!(count, Some(1));
}

#[tokio::test]
async fn worker_detailed_error_attaches_details() {
    let any = prost_types::Any {
        type_url: "type.googleapis.com/google.rpc.ErrorInfo".to_string(),
        value: b"Unauthorized access `index`".to_vec(),
    };
    let encoded = String::from_utf8(any.encode_to_vec()).unwrap();
    let message = format!("7|:|Unauthorized access `index`|:|{encoded}");

    let handler: Handler = std::sync::Arc::new(move |_| Err(PoolError::Worker(message.clone())));
    let server = serve_gateway(handler).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "Unauthorized access `index`");

    let proto = rpc::Status::decode(err.details()).unwrap();
    assert_eq!(proto.code, 7);
    assert_eq!(proto.details, vec![any]);
}

#[tokio::test]
async fn worker_headers_reach_client() {
    let context = serde_json::json!({
        "headers": r#"{"k1":"v1","x-int":42}"#,
        "trailers": r#"{"k2":"v2"}"#,
    });
    let server = serve_gateway(metadata_handler(context)).await;
    let channel = connect(server.addr).await;

    let response = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();
    let metadata = response.metadata();
    assert_eq!(metadata.get("k1").unwrap(), "v1");
    assert_eq!(metadata.get("x-int").unwrap(), "42");
    // The client folds unary trailers into the response metadata; the frame
    // placement itself is covered by the body adapter's unit test.
}

#[tokio::test]
async fn legacy_metadata_mode_sets_headers() {
    let context = serde_json::json!({"foo": "bar", "answer": "42"});
    let server = serve_gateway(metadata_handler(context)).await;
    let channel = connect(server.addr).await;

    let response = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();
    assert_eq!(response.metadata().get("foo").unwrap(), "bar");
    assert_eq!(response.metadata().get("answer").unwrap(), "42");
}

#[tokio::test]
async fn worker_error_envelope_returned_verbatim() {
    let status = rpc::Status {
        code: 7,
        message: "Unauthorized access `index`".to_string(),
        details: Vec::new(),
    };
    let context = serde_json::json!({
        "headers": r#"{"k1":"v1"}"#,
        "error": BASE64_STANDARD.encode(status.encode_to_vec()),
    });
    let server = serve_gateway(metadata_handler(context)).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    assert_eq!(err.message(), "Unauthorized access `index`");
    // Worker metadata still reaches the client on failure.
    assert_eq!(err.metadata().get("k1").unwrap(), "v1");
}

#[tokio::test]
async fn context_document_carries_metadata_and_peer() {
    let server = serve_gateway(context_echo_handler()).await;
    let channel = connect(server.addr).await;

    let response = raw_unary(
        channel,
        PING_PATH,
        b"ping".to_vec(),
        &[("custom-key", "custom-value")],
    )
    .await
    .unwrap();

    let document: serde_json::Value =
        serde_json::from_slice(response.into_inner().as_ref()).unwrap();
    assert_eq!(document["service"], "service.Echo");
    assert_eq!(document["method"], "Ping");
    assert_eq!(
        document["context"]["custom-key"],
        serde_json::json!(["custom-value"])
    );
    let peer = document["context"][":peer.address"][0].as_str().unwrap();
    assert!(peer.starts_with("127.0.0.1:"), "unexpected peer: {peer}");
    // Plaintext connection: no transport auth pseudo-header.
    assert!(document["context"].get(":peer.auth-type").is_none());
}

#[tokio::test]
async fn trace_context_injected_into_worker_context() {
    // With a real tracer installed, the dispatch span is injected into the
    // worker carrier even when the client sends no metadata at all.
    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
    opentelemetry::global::set_tracer_provider(provider);

    let server = serve_gateway(context_echo_handler()).await;
    let response = raw_unary(connect(server.addr).await, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();

    let document: serde_json::Value =
        serde_json::from_slice(response.into_inner().as_ref()).unwrap();
    let traceparent = document["context"]["traceparent"][0].as_str().unwrap();
    assert!(
        traceparent.starts_with("00-"),
        "unexpected traceparent: {traceparent}"
    );
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, "/service.Echo/Nope", b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn streaming_marked_method_is_unimplemented() {
    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, "/service.Echo/Subscribe", b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn unknown_service_is_unimplemented() {
    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, "/no.such.Service/Call", b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn stream_flag_on_reply_is_protocol_violation() {
    let handler: Handler = std::sync::Arc::new(|payload| {
        Ok(Payload {
            flags: grpc_gateway::pool::STREAM,
            body: payload.body.clone(),
            ..Payload::default()
        })
    });
    let server = serve_gateway(handler).await;
    let channel = connect(server.addr).await;

    let err = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "streaming is not supported");
}

#[tokio::test]
async fn health_check_and_watch_across_reset() {
    let server = serve_gateway_with(echo_handler(), Duration::from_millis(300), "").await;

    assert_eq!(
        health_check(connect(server.addr).await).await,
        ServingStatus::Serving
    );

    let mut watch = health_watch(connect(server.addr).await).await;
    assert_eq!(next_watch_status(&mut watch).await, ServingStatus::Serving);

    let resetting = server.gateway.clone();
    let reset_task = tokio::spawn(async move { resetting.reset().await });

    // The watcher sees the dip and the recovery, strictly alternating.
    assert_eq!(next_watch_status(&mut watch).await, ServingStatus::NotServing);
    assert_eq!(next_watch_status(&mut watch).await, ServingStatus::Serving);

    reset_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn health_list_reports_global_status() {
    use grpc_gateway::proto::health::{HealthListRequest, HealthListResponse};

    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;

    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.unwrap();
    let codec: tonic::codec::ProstCodec<HealthListRequest, HealthListResponse> =
        tonic::codec::ProstCodec::default();
    let response = grpc
        .unary(
            tonic::Request::new(HealthListRequest {}),
            http::uri::PathAndQuery::from_static("/grpc.health.v1.Health/List"),
            codec,
        )
        .await
        .unwrap();

    let statuses = response.into_inner().statuses;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses["grpc"].status, ServingStatus::Serving as i32);
}

#[tokio::test]
async fn requests_succeed_after_reset() {
    let server = serve_gateway(echo_handler()).await;

    let response = raw_unary(connect(server.addr).await, PING_PATH, b"one".to_vec(), &[])
        .await
        .unwrap();
    assert_eq!(response.into_inner().as_ref(), b"one");

    server.gateway.reset().await.unwrap();

    let response = raw_unary(connect(server.addr).await, PING_PATH, b"two".to_vec(), &[])
        .await
        .unwrap();
    assert_eq!(response.into_inner().as_ref(), b"two");

    // The pool was reset in place, not replaced; its worker set is new.
    assert_eq!(server.factory.pools_created.load(Ordering::SeqCst), 1);
    let workers = server.gateway.workers().await;
    assert_eq!(workers[0].pid, 101);
}

#[tokio::test]
async fn worker_env_carries_grpc_mode() {
    let server = serve_gateway(echo_handler()).await;
    let env = server.factory.env_seen.lock().unwrap().clone();
    assert_eq!(env.get(RR_MODE).map(String::as_str), Some(GRPC_MODE));
}

#[tokio::test]
async fn reflection_endpoint_mounts() {
    let server = serve_gateway_with(echo_handler(), Duration::ZERO, "reflection = true\n").await;
    let channel = connect(server.addr).await;

    // The proxied services still answer with reflection mounted alongside.
    let response = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();
    assert_eq!(response.into_inner().as_ref(), b"ping");
}

#[tokio::test]
async fn stop_drains_and_shuts_down() {
    let server = serve_gateway(echo_handler()).await;
    let channel = connect(server.addr).await;
    raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();

    server.gateway.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(server.gateway.serving_status(), ServingStatus::NotServing);

    // The serve future resolves cleanly on a triggered shutdown.
    server.handle.await.unwrap().unwrap();

    let refused = Endpoint::from_shared(format!("http://{}", server.addr))
        .unwrap()
        .connect()
        .await;
    assert!(refused.is_err(), "listener must be closed after stop");
}

struct TlsMaterial {
    ca_pem: String,
    server_cert: String,
    server_key: String,
    client_cert: String,
    client_key: String,
}

fn tls_material() -> TlsMaterial {
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    };

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "gateway test ca");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    server_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let client_key = KeyPair::generate().unwrap();
    let mut client_params = CertificateParams::new(vec!["gateway-client".to_string()]).unwrap();
    client_params
        .distinguished_name
        .push(DnType::CommonName, "gateway test client");
    client_params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .unwrap();

    TlsMaterial {
        ca_pem: ca_cert.pem(),
        server_cert: server_cert.pem(),
        server_key: server_key.serialize_pem(),
        client_cert: client_cert.pem(),
        client_key: client_key.serialize_pem(),
    }
}

#[tokio::test]
async fn mtls_requires_client_certificate() {
    let material = tls_material();

    let tls_dir = tempfile::tempdir().unwrap();
    let ca_path = tls_dir.path().join("ca.pem");
    let cert_path = tls_dir.path().join("server.pem");
    let key_path = tls_dir.path().join("server.key");
    std::fs::write(&ca_path, &material.ca_pem).unwrap();
    std::fs::write(&cert_path, &material.server_cert).unwrap();
    std::fs::write(&key_path, &material.server_key).unwrap();

    let tls_toml = format!(
        "[grpc.tls]\ncert = \"{}\"\nkey = \"{}\"\nroot_ca = \"{}\"\nclient_auth_type = \"require_and_verify_client_cert\"\n",
        cert_path.display(),
        key_path.display(),
        ca_path.display()
    );
    let server = serve_gateway_with(context_echo_handler(), Duration::ZERO, &tls_toml).await;
    let url = format!("https://localhost:{}", server.addr.port());

    // No client certificate: the handshake must fail.
    let bare_tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&material.ca_pem))
        .domain_name("localhost");
    let rejected = match Endpoint::from_shared(url.clone())
        .unwrap()
        .tls_config(bare_tls)
        .unwrap()
        .connect()
        .await
    {
        Err(_) => true,
        Ok(channel) => raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
            .await
            .is_err(),
    };
    assert!(rejected, "client without certificate must be rejected");

    // With a certificate the call succeeds and the worker sees the
    // authenticated transport.
    let auth_tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(&material.ca_pem))
        .identity(Identity::from_pem(
            &material.client_cert,
            &material.client_key,
        ))
        .domain_name("localhost");
    let channel = Endpoint::from_shared(url)
        .unwrap()
        .tls_config(auth_tls)
        .unwrap()
        .connect()
        .await
        .unwrap();

    let response = raw_unary(channel, PING_PATH, b"ping".to_vec(), &[])
        .await
        .unwrap();
    let document: serde_json::Value =
        serde_json::from_slice(response.into_inner().as_ref()).unwrap();
    assert_eq!(
        document["context"][":peer.auth-type"],
        serde_json::json!(["tls"])
    );
    let peer = document["context"][":peer.address"][0].as_str().unwrap();
    assert!(peer.starts_with("127.0.0.1:"), "unexpected peer: {peer}");
}
