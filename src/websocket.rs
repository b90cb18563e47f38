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

//! A minimal WebSocket client, enough to drive the Kubernetes exec subresource.
//!
//! The client is an explicit state machine (`Connecting -> Open -> Closed | Errored`). A
//! reader task owns the read half of the connection and turns frames into [`Event`]s,
//! delivered in wire order over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::socket::{self, ConnectOptions};

pub mod frame;
pub mod handshake;

use frame::{Frame, OpCode};

/// Largest message accepted once fragments are reassembled.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("websocket handshake error: {0}")]
    Handshake(String),
    #[error("websocket protocol error: {0}")]
    Protocol(String),
    #[error("websocket is not open")]
    NotOpen,
    #[error("{0}")]
    Socket(#[from] socket::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Open,
    Closed,
    Errored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Open,
    Message(Message),
    Close(Option<u16>),
    Error(String),
}

#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub connect: ConnectOptions,
    /// Extra request headers sent with the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Overrides [`MAX_MESSAGE_SIZE`].
    pub max_message_size: Option<usize>,
}

type Writer = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct Shared {
    state: Mutex<State>,
    close_sent: AtomicBool,
}

impl Shared {
    fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Moves from Open to `next`, returning false if the client had already left Open.
    fn leave_open(&self, next: State) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == State::Open {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Marks our close frame as sent, returning false if it already was.
    fn mark_close_sent(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }
}

pub struct WebSocketClient {
    shared: Arc<Shared>,
    writer: Option<Writer>,
    events: mpsc::UnboundedReceiver<Event>,
    handshake_error: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl WebSocketClient {
    /// Connects to `url` and performs the upgrade handshake.
    ///
    /// A server that answers the upgrade incorrectly does not produce an error here: the
    /// client is returned never having opened, with [`WebSocketClient::handshake_error`] set.
    #[instrument(skip_all, fields(path = url.path()))]
    pub async fn connect(url: &Url, options: &ClientOptions) -> Result<Self, Error> {
        let stream = socket::connect(url, &options.connect).await?;
        Self::handshake(stream, url, options).await
    }

    pub async fn handshake<S>(stream: S, url: &Url, options: &ClientOptions) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let key = handshake::generate_key();
        write_half
            .write_all(handshake::request(url, &key, &options.headers)?.as_bytes())
            .await?;
        write_half.flush().await?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State::Connecting),
            close_sent: AtomicBool::new(false),
        });
        let (tx, events) = mpsc::unbounded_channel();

        let mut buf = BytesMut::with_capacity(4096);
        let validated = match handshake::read_response_head(&mut read_half, &mut buf).await {
            Ok(head) => handshake::validate_response(&head, &key),
            Err(e) => Err(e),
        };
        if let Err(e) = validated {
            warn!("websocket handshake failed: {e}");
            shared.set_state(State::Errored);
            return Ok(WebSocketClient {
                shared,
                writer: None,
                events,
                handshake_error: Some(e.to_string()),
                reader: None,
            });
        }

        debug!("websocket open");
        shared.set_state(State::Open);
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(Box::new(write_half)));
        // The receiver is owned by us, so this cannot fail.
        let _ = tx.send(Event::Open);
        let reader = tokio::spawn(read_loop(
            read_half,
            buf,
            writer.clone(),
            shared.clone(),
            tx,
            options.max_message_size.unwrap_or(MAX_MESSAGE_SIZE),
        ));
        Ok(WebSocketClient {
            shared,
            writer: Some(writer),
            events,
            handshake_error: None,
            reader: Some(reader),
        })
    }

    #[cfg(test)]
    fn state(&self) -> State {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state() == State::Open
    }

    pub fn handshake_error(&self) -> Option<&str> {
        self.handshake_error.as_deref()
    }

    /// Sends a binary message.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.write(Frame::new(OpCode::Binary, data)).await
    }

    /// Starts the closing handshake. The session completes when the peer answers.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.is_open() || !self.shared.mark_close_sent() {
            return Ok(());
        }
        self.write(Frame::close(Some(1000))).await
    }

    /// Waits for the next event. Returns `None` once the reader has stopped and every
    /// event has been consumed.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    async fn write(&self, frame: Frame) -> Result<(), Error> {
        match (&self.writer, self.is_open()) {
            (Some(writer), true) => Ok(write_frame(writer, &frame).await?),
            _ => Err(Error::NotOpen),
        }
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn write_frame(writer: &Writer, frame: &Frame) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    frame.encode(Some(rand::random()), &mut buf);
    let mut w = writer.lock().await;
    w.write_all(&buf).await?;
    w.flush().await
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    mut buf: BytesMut,
    writer: Writer,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Event>,
    max_message_size: usize,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut fragments: Option<(OpCode, BytesMut)> = None;
    loop {
        loop {
            let frame = match Frame::decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    fail(&shared, &tx, e.to_string());
                    return;
                }
            };
            trace!(opcode = ?frame.opcode, len = frame.payload.len(), "frame");
            let assembled = fragments.as_ref().map_or(0, |(_, data)| data.len());
            if !frame.opcode.is_control() && assembled + frame.payload.len() > max_message_size {
                fail(
                    &shared,
                    &tx,
                    format!("message exceeds {max_message_size} bytes"),
                );
                return;
            }
            match frame.opcode {
                OpCode::Text | OpCode::Binary if frame.fin => {
                    if fragments.is_some() {
                        fail(&shared, &tx, "new message inside fragmented message".into());
                        return;
                    }
                    let _ = tx.send(Event::Message(to_message(frame.opcode, frame.payload)));
                }
                OpCode::Text | OpCode::Binary => {
                    fragments = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
                OpCode::Continuation => {
                    let Some((opcode, mut data)) = fragments.take() else {
                        fail(&shared, &tx, "unexpected continuation frame".into());
                        return;
                    };
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let _ = tx.send(Event::Message(to_message(opcode, data.freeze())));
                    } else {
                        fragments = Some((opcode, data));
                    }
                }
                OpCode::Ping => {
                    if let Err(e) = write_frame(&writer, &Frame::new(OpCode::Pong, frame.payload)).await {
                        fail(&shared, &tx, e.to_string());
                        return;
                    }
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let code = frame.close_code();
                    debug!(?code, "received close");
                    if shared.mark_close_sent() {
                        let _ = write_frame(&writer, &Frame::close(code)).await;
                    }
                    if shared.leave_open(State::Closed) {
                        let _ = tx.send(Event::Close(code));
                    }
                    return;
                }
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("connection closed by peer");
                if shared.leave_open(State::Closed) {
                    let _ = tx.send(Event::Close(None));
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                fail(&shared, &tx, e.to_string());
                return;
            }
        }
    }
}

fn fail(shared: &Shared, tx: &mpsc::UnboundedSender<Event>, error: String) {
    warn!("websocket error: {error}");
    if shared.leave_open(State::Errored) {
        let _ = tx.send(Event::Error(error));
    }
}

fn to_message(opcode: OpCode, payload: Bytes) -> Message {
    match opcode {
        OpCode::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
        _ => Message::Binary(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ws::{self, ServerAction};

    fn url(addr: std::net::SocketAddr) -> Url {
        Url::parse(&format!("ws://127.0.0.1:{}/exec?x=1", addr.port())).unwrap()
    }

    #[tokio::test]
    async fn open_message_close() {
        let server = ws::spawn(vec![
            ServerAction::Send(Frame::new(OpCode::Binary, &b"\x01hello"[..])),
            ServerAction::Send(Frame::new(OpCode::Text, "hi")),
            ServerAction::Send(Frame::close(Some(1000))),
        ])
        .await;
        let mut client = WebSocketClient::connect(&url(server.addr), &ClientOptions::default())
            .await
            .unwrap();
        assert!(client.handshake_error().is_none());
        assert!(client.is_open());
        assert_eq!(client.next_event().await, Some(Event::Open));
        assert_eq!(
            client.next_event().await,
            Some(Event::Message(Message::Binary(Bytes::from_static(b"\x01hello"))))
        );
        assert_eq!(
            client.next_event().await,
            Some(Event::Message(Message::Text("hi".to_string())))
        );
        assert_eq!(client.next_event().await, Some(Event::Close(Some(1000))));
        assert_eq!(client.state(), State::Closed);
        assert_eq!(client.next_event().await, None);
    }

    #[tokio::test]
    async fn request_headers_and_client_frames() {
        let server = ws::spawn(vec![ServerAction::AwaitClose]).await;
        let options = ClientOptions {
            headers: vec![("Authorization".to_string(), "Bearer token".to_string())],
            ..Default::default()
        };
        let mut client = WebSocketClient::connect(&url(server.addr), &options)
            .await
            .unwrap();
        assert_eq!(client.next_event().await, Some(Event::Open));
        client.send(&b"\x00data"[..]).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.next_event().await, Some(Event::Close(Some(1000))));

        let seen = server.finish().await;
        assert!(seen.request.starts_with("GET /exec?x=1 HTTP/1.1\r\n"));
        assert!(seen.request.contains("Authorization: Bearer token\r\n"));
        assert_eq!(seen.frames[0], Frame::new(OpCode::Binary, &b"\x00data"[..]));
        assert_eq!(seen.frames[1].opcode, OpCode::Close);
    }

    #[tokio::test]
    async fn fragmented_and_ping() {
        let server = ws::spawn(vec![
            ServerAction::Send(Frame {
                fin: false,
                opcode: OpCode::Binary,
                payload: Bytes::from_static(b"\x01par"),
            }),
            ServerAction::Send(Frame::new(OpCode::Ping, "p")),
            ServerAction::Send(Frame::new(OpCode::Continuation, "ts")),
            ServerAction::Send(Frame::close(None)),
        ])
        .await;
        let mut client = WebSocketClient::connect(&url(server.addr), &ClientOptions::default())
            .await
            .unwrap();
        assert_eq!(client.next_event().await, Some(Event::Open));
        assert_eq!(
            client.next_event().await,
            Some(Event::Message(Message::Binary(Bytes::from_static(b"\x01parts"))))
        );
        assert_eq!(client.next_event().await, Some(Event::Close(None)));
        let seen = server.finish().await;
        assert!(seen.frames.contains(&Frame::new(OpCode::Pong, "p")));
    }

    #[tokio::test]
    async fn oversized_message_fails() {
        let server = ws::spawn(vec![
            ServerAction::Send(Frame {
                fin: false,
                opcode: OpCode::Binary,
                payload: Bytes::from_static(b"\x01par"),
            }),
            ServerAction::Send(Frame::new(OpCode::Continuation, "ts and more")),
            ServerAction::Hangup,
        ])
        .await;
        let options = ClientOptions {
            max_message_size: Some(8),
            ..Default::default()
        };
        let mut client = WebSocketClient::connect(&url(server.addr), &options)
            .await
            .unwrap();
        assert_eq!(client.next_event().await, Some(Event::Open));
        assert_eq!(
            client.next_event().await,
            Some(Event::Error("message exceeds 8 bytes".to_string()))
        );
        assert_eq!(client.state(), State::Errored);
        assert_eq!(client.next_event().await, None);
    }

    #[tokio::test]
    async fn close_is_sent_once() {
        let server = ws::spawn(vec![ServerAction::AwaitClose]).await;
        let mut client = WebSocketClient::connect(&url(server.addr), &ClientOptions::default())
            .await
            .unwrap();
        assert_eq!(client.next_event().await, Some(Event::Open));
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.next_event().await, Some(Event::Close(Some(1000))));
        let seen = server.finish().await;
        let closes = seen.frames.iter().filter(|f| f.opcode == OpCode::Close).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn eof_closes() {
        let server = ws::spawn(vec![ServerAction::Hangup]).await;
        let mut client = WebSocketClient::connect(&url(server.addr), &ClientOptions::default())
            .await
            .unwrap();
        assert_eq!(client.next_event().await, Some(Event::Open));
        assert_eq!(client.next_event().await, Some(Event::Close(None)));
        assert!(matches!(client.send(&b"x"[..]).await, Err(Error::NotOpen)));
    }

    #[tokio::test]
    async fn bad_accept_never_opens() {
        let server = ws::spawn_with_bad_accept().await;
        let mut client = WebSocketClient::connect(&url(server.addr), &ClientOptions::default())
            .await
            .unwrap();
        assert!(!client.is_open());
        assert!(client.handshake_error().unwrap().contains("Sec-WebSocket-Accept"));
        assert_eq!(client.next_event().await, None);
    }
}
