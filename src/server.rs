// Copyright Istio Authors
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

//! The authenticator's HTTP surface.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::hyper_util::{Body, Server, empty_response, plaintext_response};
use crate::inject::{self, InjectRequest};
use crate::{signal, telemetry};

const HOST_ID_PREFIX: &str = "Host-Id-Prefix";
const MAX_CSR_BYTES: usize = 64 * 1024;

/// Runs one certificate injection. Implemented by the application over its live collaborators.
#[async_trait::async_trait]
pub trait Injector: Send + Sync {
    async fn inject(&self, req: &InjectRequest<'_>) -> Result<(), inject::Error>;
}

pub struct Service<I> {
    server: Server<State<I>>,
}

struct State<I> {
    account: String,
    injector: I,
}

impl<I: Injector + 'static> Service<I> {
    pub async fn new(
        addr: SocketAddr,
        account: String,
        injector: I,
        shutdown_trigger: signal::ShutdownTrigger,
        drain_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let state = State { account, injector };
        Server::bind("authn-k8s", addr, shutdown_trigger, drain_rx, state)
            .await
            .map(|server| Service { server })
    }

    pub fn address(&self) -> SocketAddr {
        self.server.address()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        self.server.spawn(|state, remote, req| async move {
            Ok::<_, Infallible>(handle(&state, remote, req).await)
        })
    }
}

async fn handle<I: Injector>(
    state: &State<I>,
    remote: SocketAddr,
    req: Request<Incoming>,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    match (req.method(), path.as_str()) {
        (&Method::GET, "/healthz") => empty_response(StatusCode::OK),
        (_, "/logging") => handle_logging(req),
        (&Method::POST, path) => match inject_service_id(path) {
            Some(service_id) => handle_inject(state, service_id, remote, req).await,
            None => empty_response(StatusCode::NOT_FOUND),
        },
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

/// Matches `/authn-k8s/<service_id>/inject_client_cert`.
fn inject_service_id(path: &str) -> Option<&str> {
    let service_id = path
        .strip_prefix("/authn-k8s/")?
        .strip_suffix("/inject_client_cert")?;
    (!service_id.is_empty() && !service_id.contains('/')).then_some(service_id)
}

#[instrument(skip_all, fields(service_id = service_id, client = %remote))]
async fn handle_inject<I: Injector>(
    state: &State<I>,
    service_id: &str,
    remote: SocketAddr,
    req: Request<Incoming>,
) -> Response<Body> {
    let host_id_prefix = match req.headers().get(HOST_ID_PREFIX).map(|v| v.to_str()) {
        Some(Ok(prefix)) => Some(prefix.to_string()),
        Some(Err(_)) => {
            return plaintext_response(
                StatusCode::BAD_REQUEST,
                format!("invalid {HOST_ID_PREFIX} header\n"),
            );
        }
        None => None,
    };
    let csr = match Limited::new(req.into_body(), MAX_CSR_BYTES).collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            return plaintext_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {e}\n"),
            );
        }
    };
    let client_ip = remote.ip().to_string();
    let request = InjectRequest {
        account: &state.account,
        service_id,
        csr: &csr,
        host_id_prefix: host_id_prefix.as_deref(),
        client_ip: Some(&client_ip),
    };
    match state.injector.inject(&request).await {
        Ok(()) => empty_response(StatusCode::ACCEPTED),
        Err(e) => match e.code() {
            Some(code) => {
                warn!("authentication failed: {e}");
                plaintext_response(StatusCode::UNAUTHORIZED, format!("{code}\n"))
            }
            None => {
                warn!("certificate injection failed: {e}");
                plaintext_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error\n".to_string(),
                )
            }
        },
    }
}

static HELP_STRING: &str = "
usage: GET /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)
usage: POST /logging?reset\t\t\t\t\t(To reset to the startup level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. authn_k8s::exec
";

fn handle_logging(req: Request<Incoming>) -> Response<Body> {
    match *req.method() {
        Method::GET => list_loggers(),
        Method::POST => {
            let qp: HashMap<String, String> = req
                .uri()
                .query()
                .map(|v| {
                    url::form_urlencoded::parse(v.as_bytes())
                        .into_owned()
                        .collect()
                })
                .unwrap_or_default();
            let level = qp.get("level").cloned();
            let reset = qp.contains_key("reset");
            if level.is_some() || reset {
                change_log_level(reset, &level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Body> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => {
            plaintext_response(StatusCode::OK, format!("current log level is {loglevel}\n"))
        }
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Body> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}
