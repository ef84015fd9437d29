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

//! Protobuf message types for the well-known packages the gateway speaks
//! natively: `google.rpc` (error envelopes) and `grpc.health.v1` (the
//! standard health-checking protocol).
//!
//! The user payloads proxied to workers are never parsed, so these are the
//! only schemas the crate needs; they are written out as prost derives to
//! avoid a build-time protobuf toolchain.

/// Messages from the `google.rpc` package.
pub mod rpc {
    /// The `google.rpc.Status` message. Workers encode application failures
    /// as a serialized `Status`; the gateway returns it to clients verbatim.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        /// A status code from `google.rpc.Code`.
        #[prost(int32, tag = "1")]
        pub code: i32,
        /// A developer-facing error message.
        #[prost(string, tag = "2")]
        pub message: ::prost::alloc::string::String,
        /// A list of messages that carry the error details.
        #[prost(message, repeated, tag = "3")]
        pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
    }
}

/// Messages from the `grpc.health.v1` package.
pub mod health {
    /// Fully-qualified name of the health service.
    pub const SERVICE_NAME: &str = "grpc.health.v1.Health";

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HealthCheckRequest {
        #[prost(string, tag = "1")]
        pub service: ::prost::alloc::string::String,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct HealthCheckResponse {
        #[prost(enumeration = "ServingStatus", tag = "1")]
        pub status: i32,
    }

    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct HealthListRequest {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct HealthListResponse {
        /// Statuses of the services watched by the server, keyed by service
        /// name.
        #[prost(map = "string, message", tag = "1")]
        pub statuses:
            ::std::collections::HashMap<::prost::alloc::string::String, HealthCheckResponse>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ServingStatus {
        Unknown = 0,
        Serving = 1,
        NotServing = 2,
        /// Used only by the `Watch` method in the standard protocol; the
        /// gateway tracks a single global status and never reports it.
        ServiceUnknown = 3,
    }

    impl ServingStatus {
        /// String value of the enum field name, as it appears in the proto
        /// definition.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                ServingStatus::Unknown => "UNKNOWN",
                ServingStatus::Serving => "SERVING",
                ServingStatus::NotServing => "NOT_SERVING",
                ServingStatus::ServiceUnknown => "SERVICE_UNKNOWN",
            }
        }
    }
}
