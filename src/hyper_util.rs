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

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::signal;
use crate::socket::Listener;

pub type Body = Full<Bytes>;

pub fn empty_response(code: hyper::StatusCode) -> Response<Body> {
    let mut resp = Response::new(Body::default());
    *resp.status_mut() = code;
    resp
}

pub fn plaintext_response(code: hyper::StatusCode, body: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = code;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    resp
}

/// Signals servers to stop accepting and finish in-flight requests.
pub fn drain_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub struct Server<S> {
    name: String,
    addr: SocketAddr,
    listener: Listener,
    shutdown_trigger: signal::ShutdownTrigger,
    drain_rx: watch::Receiver<bool>,
    state: Arc<S>,
}

impl<S> Server<S> {
    pub async fn bind(
        name: &str,
        addr: SocketAddr,
        shutdown_trigger: signal::ShutdownTrigger,
        drain_rx: watch::Receiver<bool>,
        s: S,
    ) -> io::Result<Self> {
        let listener = Listener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Server {
            name: name.to_string(),
            addr,
            listener,
            shutdown_trigger,
            drain_rx,
            state: Arc::new(s),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// Serves connections until the drain channel fires, then waits for open connections to
    /// finish. The returned handle completes once the drain is done.
    pub fn spawn<F, R>(self, f: F) -> JoinHandle<()>
    where
        S: Send + Sync + 'static,
        F: Fn(Arc<S>, SocketAddr, Request<Incoming>) -> R + Send + Sync + 'static,
        R: Future<Output = Result<Response<Body>, Infallible>> + Send + 'static,
    {
        let Server {
            name,
            addr,
            listener,
            shutdown_trigger,
            mut drain_rx,
            state,
        } = self;
        let f = Arc::new(f);
        info!(address=%addr, component=name, "listener established");
        tokio::spawn(async move {
            let graceful = GracefulShutdown::new();
            loop {
                let (stream, remote) = tokio::select! {
                    res = listener.accept() => match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("{name}: accept failed: {e}");
                            shutdown_trigger.shutdown_now().await;
                            break;
                        }
                    },
                    _ = drain_rx.changed() => break,
                };
                debug!(%remote, "{name}: accepted connection");
                let state = state.clone();
                let f = f.clone();
                let service = hyper::service::service_fn(move |req| f(state.clone(), remote, req));
                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .half_close(true)
                    .header_read_timeout(Duration::from_secs(2))
                    .max_buf_size(8 * 1024)
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("{name}: connection error: {e}");
                    }
                });
            }
            info!("starting drain of {name} server");
            graceful.shutdown().await;
            info!("{name} server terminated");
        })
    }
}
