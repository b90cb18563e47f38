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

//! Runs a command inside a pod's container over the Kubernetes exec subresource.
//!
//! Every WebSocket message carries a one-byte channel selector followed by the payload. The
//! executor collects the payloads per channel until the server closes the session, bounded by a
//! single deadline covering connect, handshake and the session itself.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::k8s::K8sObjectLookup;
use crate::websocket::{self, ClientOptions, Event, Message, WebSocketClient};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "CONJ00033E Command timed out in container '{container}' of pod '{pod}' after {} seconds",
        .timeout.as_secs()
    )]
    TimedOut {
        timeout: Duration,
        container: String,
        pod: String,
    },
    #[error("CONJ00153E Error executing in container '{container}' of pod '{pod}': {message}")]
    Command {
        container: String,
        pod: String,
        message: String,
    },
    #[error("invalid exec url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    WebSocket(#[from] websocket::Error),
}

impl Error {
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::TimedOut { .. } => Some("CONJ00033E"),
            Error::Command { .. } => Some("CONJ00153E"),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Error = 3,
    Resize = 4,
}

impl TryFrom<u8> for Channel {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0 => Channel::Stdin,
            1 => Channel::Stdout,
            2 => Channel::Stderr,
            3 => Channel::Error,
            4 => Channel::Resize,
            other => return Err(other),
        })
    }
}

impl Channel {
    /// Prefixes `payload` with the channel selector.
    pub fn encode(self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(self as u8);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Splits a message into its channel and payload. Unknown channels are returned as the
    /// raw selector byte.
    pub fn decode(message: &[u8]) -> Option<(Result<Channel, u8>, &[u8])> {
        let (&selector, payload) = message.split_first()?;
        Some((Channel::try_from(selector), payload))
    }
}

/// Everything received on a session, one entry per message, per channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageLog {
    pub stdin: Vec<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Vec<String>,
}

impl MessageLog {
    fn push(&mut self, channel: Channel, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        match channel {
            Channel::Stdin => self.stdin.push(text),
            Channel::Stdout => self.stdout.push(text),
            Channel::Stderr => self.stderr.push(text),
            Channel::Error => self.error.push(text),
            Channel::Resize => debug!("ignoring resize message"),
        }
    }

    /// The error channel joined into one string, or `None` if nothing was received on it.
    pub fn error_text(&self) -> Option<String> {
        (!self.error.is_empty()).then(|| self.error.concat())
    }
}

/// One WebSocket session, as seen by the executor.
#[async_trait::async_trait]
pub trait Session: Send {
    fn handshake_error(&self) -> Option<String>;
    async fn send(&mut self, data: Bytes) -> Result<(), websocket::Error>;
    async fn close(&mut self) -> Result<(), websocket::Error>;
    async fn next_event(&mut self) -> Option<Event>;
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        options: &ClientOptions,
    ) -> Result<Box<dyn Session>, websocket::Error>;
}

#[async_trait::async_trait]
impl Session for WebSocketClient {
    fn handshake_error(&self) -> Option<String> {
        WebSocketClient::handshake_error(self).map(str::to_string)
    }

    async fn send(&mut self, data: Bytes) -> Result<(), websocket::Error> {
        WebSocketClient::send(self, data).await
    }

    async fn close(&mut self) -> Result<(), websocket::Error> {
        WebSocketClient::close(self).await
    }

    async fn next_event(&mut self) -> Option<Event> {
        WebSocketClient::next_event(self).await
    }
}

/// Connects real WebSocket sessions.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &Url,
        options: &ClientOptions,
    ) -> Result<Box<dyn Session>, websocket::Error> {
        Ok(Box::new(WebSocketClient::connect(url, options).await?))
    }
}

/// Builds the exec subresource URL, keeping any path prefix and query of the API URL.
pub fn exec_url(
    api_url: &Url,
    namespace: &str,
    pod: &str,
    container: &str,
    cmds: &[&str],
    stdin: bool,
) -> Result<Url, Error> {
    let mut url = api_url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(Error::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::InvalidUrl(api_url.to_string()))?;
    let path = format!(
        "{}/api/v1/namespaces/{namespace}/pods/{pod}/exec",
        url.path().trim_end_matches('/')
    );
    url.set_path(&path);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("container", container)
            .append_pair("stderr", "true")
            .append_pair("stdout", "true");
        if stdin {
            query.append_pair("stdin", "true");
        }
        for cmd in cmds {
            query.append_pair("command", cmd);
        }
    }
    Ok(url)
}

/// What to run, and where.
#[derive(Clone, Debug)]
pub struct ExecRequest<'a> {
    pub namespace: &'a str,
    pub pod: &'a str,
    pub container: &'a str,
    pub cmds: &'a [&'a str],
    /// Sent on the stdin channel once the session opens.
    pub body: Option<&'a str>,
    pub stdin: bool,
}

pub struct ExecuteCommandInContainer<C = WebSocketConnector> {
    connector: C,
    timeout: Duration,
}

impl ExecuteCommandInContainer<WebSocketConnector> {
    pub fn new(timeout: Duration) -> Self {
        Self::with_connector(WebSocketConnector, timeout)
    }
}

impl<C: Connector> ExecuteCommandInContainer<C> {
    pub fn with_connector(connector: C, timeout: Duration) -> Self {
        ExecuteCommandInContainer { connector, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the command and returns everything the container sent back. Fails if the session
    /// does not close before the timeout.
    #[instrument(name = "exec", skip_all, fields(namespace = req.namespace, pod = req.pod, container = req.container))]
    pub async fn call(
        &self,
        lookup: &dyn K8sObjectLookup,
        req: &ExecRequest<'_>,
    ) -> Result<MessageLog, Error> {
        let url = exec_url(
            lookup.api_url(),
            req.namespace,
            req.pod,
            req.container,
            req.cmds,
            req.stdin,
        )?;
        let options = ClientOptions {
            connect: lookup.connect_options(),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {}", lookup.bearer_token()),
            )],
            ..Default::default()
        };
        let deadline = Instant::now() + self.timeout;
        let session = async {
            let mut session = self.connector.connect(&url, &options).await?;
            if let Some(e) = session.handshake_error() {
                return Err(Error::Command {
                    container: req.container.to_string(),
                    pod: req.pod.to_string(),
                    message: e,
                });
            }
            run(session.as_mut(), req.body, req.stdin).await
        };
        match tokio::time::timeout_at(deadline, session).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut {
                timeout: self.timeout,
                container: req.container.to_string(),
                pod: req.pod.to_string(),
            }),
        }
    }
}

/// Drives one session to completion. Once stdin has been written, or if the command takes
/// none, the client starts the close; the server answers once the command exits.
async fn run(
    session: &mut dyn Session,
    body: Option<&str>,
    stdin: bool,
) -> Result<MessageLog, Error> {
    let mut log = MessageLog::default();
    while let Some(event) = session.next_event().await {
        match event {
            Event::Open => {
                debug!("exec session open");
                if let Some(body) = body {
                    session.send(Channel::Stdin.encode(body.as_bytes())).await?;
                }
                if body.is_some() || !stdin {
                    session.close().await?;
                }
            }
            Event::Message(Message::Binary(data)) => record(&mut log, &data),
            Event::Message(Message::Text(text)) => record(&mut log, text.as_bytes()),
            Event::Close(code) => {
                debug!(?code, "exec session closed");
                return Ok(log);
            }
            Event::Error(e) => {
                warn!("exec session error: {e}");
                log.error.push(e);
            }
        }
    }
    Ok(log)
}

fn record(log: &mut MessageLog, message: &[u8]) {
    match Channel::decode(message) {
        Some((Ok(channel), payload)) => log.push(channel, payload),
        Some((Err(selector), _)) => warn!(selector, "dropping message on unknown channel"),
        None => debug!("dropping empty message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use crate::test_helpers::k8s::FakeK8s;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[test]
    fn channel_round_trip() {
        for channel in [Channel::Stdin, Channel::Stdout, Channel::Stderr, Channel::Error] {
            let encoded = Channel::encode(channel, b"\x00payload\xff");
            assert_eq!(
                Channel::decode(&encoded),
                Some((Ok(channel), &b"\x00payload\xff"[..]))
            );
        }
        assert_eq!(Channel::decode(b"\x09x"), Some((Err(9), &b"x"[..])));
        assert_eq!(Channel::decode(b""), None);
    }

    #[test]
    fn url() {
        let api = Url::parse("https://k8s.example:6443/prefix/?a=b").unwrap();
        let url = exec_url(&api, "ns", "p1", "authenticator", &["sh", "-s"], true).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://k8s.example:6443/prefix/api/v1/namespaces/ns/pods/p1/exec?a=b&container=authenticator&stderr=true&stdout=true&stdin=true&command=sh&command=-s"
        );
        let plain = exec_url(
            &Url::parse("http://k8s").unwrap(),
            "ns",
            "p1",
            "c",
            &["ls"],
            false,
        )
        .unwrap();
        assert_eq!(
            plain.as_str(),
            "ws://k8s/api/v1/namespaces/ns/pods/p1/exec?container=c&stderr=true&stdout=true&command=ls"
        );
    }

    /// A scripted session: replays `events` as they are fed. With `answer_close`, a close from
    /// the client is answered like a server would.
    struct FakeSession {
        handshake_error: Option<String>,
        events: mpsc::UnboundedReceiver<Event>,
        sent: Arc<Mutex<Vec<Bytes>>>,
        closes: Arc<AtomicUsize>,
        answer_close: bool,
        close_pending: bool,
    }

    #[async_trait::async_trait]
    impl Session for FakeSession {
        fn handshake_error(&self) -> Option<String> {
            self.handshake_error.clone()
        }

        async fn send(&mut self, data: Bytes) -> Result<(), websocket::Error> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), websocket::Error> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.close_pending = self.answer_close;
            Ok(())
        }

        async fn next_event(&mut self) -> Option<Event> {
            if std::mem::take(&mut self.close_pending) {
                return Some(Event::Close(Some(1000)));
            }
            self.events.recv().await
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        handshake_error: Option<String>,
        events: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
        sent: Arc<Mutex<Vec<Bytes>>>,
        closes: Arc<AtomicUsize>,
        answer_close: bool,
        urls: Mutex<Vec<(Url, Vec<(String, String)>)>>,
    }

    impl FakeConnector {
        fn new(handshake_error: Option<&str>) -> (Self, mpsc::UnboundedSender<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = FakeConnector {
                handshake_error: handshake_error.map(str::to_string),
                events: Mutex::new(Some(rx)),
                ..Default::default()
            };
            (connector, tx)
        }
    }

    #[async_trait::async_trait]
    impl<'a> Connector for &'a FakeConnector {
        async fn connect(
            &self,
            url: &Url,
            options: &ClientOptions,
        ) -> Result<Box<dyn Session>, websocket::Error> {
            self.urls
                .lock()
                .unwrap()
                .push((url.clone(), options.headers.clone()));
            Ok(Box::new(FakeSession {
                handshake_error: self.handshake_error.clone(),
                events: self.events.lock().unwrap().take().unwrap(),
                sent: self.sent.clone(),
                closes: self.closes.clone(),
                answer_close: self.answer_close,
                close_pending: false,
            }))
        }
    }

    fn request<'a>(body: Option<&'a str>) -> ExecRequest<'a> {
        ExecRequest {
            namespace: "ns",
            pod: "p1",
            container: "authenticator",
            cmds: &["sh", "-s"],
            body,
            stdin: body.is_some(),
        }
    }

    fn binary(channel: Channel, payload: &str) -> Event {
        Event::Message(Message::Binary(channel.encode(payload.as_bytes())))
    }

    #[tokio::test]
    async fn collects_channels() {
        let lookup = FakeK8s::default();
        let (connector, tx) = FakeConnector::new(None);
        for event in [
            Event::Open,
            binary(Channel::Stdout, "out"),
            binary(Channel::Stderr, "err"),
            Event::Message(Message::Binary(Bytes::from_static(b"\x07junk"))),
            binary(Channel::Error, ""),
            Event::Close(Some(1000)),
        ] {
            tx.send(event).unwrap();
        }
        let exec = ExecuteCommandInContainer::with_connector(&connector, DEFAULT_TIMEOUT);
        let log = exec.call(&lookup, &request(Some("echo hi"))).await.unwrap();
        assert_eq!(log.stdout, vec!["out"]);
        assert_eq!(log.stderr, vec!["err"]);
        assert_eq!(log.error_text(), Some(String::new()));
        assert_eq!(
            connector.sent.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"\x00echo hi")]
        );
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        let urls = connector.urls.lock().unwrap();
        assert!(urls[0].0.as_str().contains("command=sh&command=-s"));
        assert_eq!(
            urls[0].1,
            vec![("Authorization".to_string(), "Bearer fake-token".to_string())]
        );
    }

    #[tokio::test]
    async fn handshake_error_fails_fast() {
        let lookup = FakeK8s::default();
        let (connector, _tx) = FakeConnector::new(Some("invalid Sec-WebSocket-Accept"));
        let exec = ExecuteCommandInContainer::with_connector(&connector, Duration::from_secs(3600));
        let err = exec.call(&lookup, &request(None)).await.unwrap_err();
        assert_eq!(err.code(), Some("CONJ00153E"));
        assert!(err.to_string().contains("invalid Sec-WebSocket-Accept"));
    }

    #[tokio::test(start_paused = true)]
    async fn closes_at_once_without_stdin() {
        let lookup = FakeK8s::default();
        let (mut connector, tx) = FakeConnector::new(None);
        connector.answer_close = true;
        tx.send(Event::Open).unwrap();
        let exec = ExecuteCommandInContainer::with_connector(&connector, Duration::from_secs(5));
        let log = exec.call(&lookup, &request(None)).await.unwrap();
        assert_eq!(log, MessageLog::default());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert!(connector.sent.lock().unwrap().is_empty());
    }

    // Stdin is expected but nothing is sent, so only the server can end the session.
    async fn close_after(delay: Duration) -> Result<MessageLog, Error> {
        let lookup = FakeK8s::default();
        let (connector, tx) = FakeConnector::new(None);
        tx.send(Event::Open).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Close(None));
        });
        let exec = ExecuteCommandInContainer::with_connector(&connector, Duration::from_secs(5));
        let req = ExecRequest {
            stdin: true,
            ..request(None)
        };
        let result = exec.call(&lookup, &req).await;
        assert_eq!(connector.closes.load(Ordering::SeqCst), 0);
        result
    }

    #[tokio::test(start_paused = true)]
    async fn closes_just_before_timeout() {
        close_after(Duration::from_millis(4999)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let err = close_after(Duration::from_millis(5001)).await.unwrap_err();
        assert_matches!(err, Error::TimedOut { .. });
        assert_eq!(
            err.to_string(),
            "CONJ00033E Command timed out in container 'authenticator' of pod 'p1' after 5 seconds"
        );
    }
}
