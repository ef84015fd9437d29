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

//! Transport credential selection.
//!
//! No TLS section means plaintext. A cert/key pair enables server TLS; a
//! client CA bundle on top enables mutual TLS. The client-auth enum maps
//! onto the two postures the TLS backend supports: certificates are either
//! required or verified-when-given, so the remaining modes degrade to the
//! nearest posture with a warning. TLS 1.2 is the backend's floor already.

use std::io;

use log::warn;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::{ClientAuthType, TlsConfig};

pub(crate) fn server_tls_config(tls: &TlsConfig) -> io::Result<ServerTlsConfig> {
    let cert = std::fs::read_to_string(&tls.cert)?;
    let key = std::fs::read_to_string(&tls.key)?;
    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(root_ca) = &tls.root_ca {
        let ca = std::fs::read_to_string(root_ca)?;
        match tls.client_auth_type {
            ClientAuthType::NoClientCert | ClientAuthType::RequestClientCert => {
                warn!(
                    "client auth type {:?} does not verify client certificates; \
                     root ca is loaded but clients are not authenticated",
                    tls.client_auth_type
                );
            }
            ClientAuthType::RequireAnyClientCert => {
                warn!(
                    "client auth type require_any_client_cert is not supported by the \
                     tls backend; client certificates will be verified against the root ca"
                );
                config = config.client_ca_root(Certificate::from_pem(ca));
            }
            ClientAuthType::VerifyClientCertIfGiven => {
                config = config
                    .client_ca_root(Certificate::from_pem(ca))
                    .client_auth_optional(true);
            }
            ClientAuthType::RequireAndVerifyClientCert => {
                config = config.client_ca_root(Certificate::from_pem(ca));
            }
        }
    }

    Ok(config)
}
