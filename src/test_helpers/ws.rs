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

//! Single-connection WebSocket servers for client tests.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::read_head;
use crate::websocket::frame::{Frame, OpCode};
use crate::websocket::handshake;

pub enum ServerAction {
    Send(Frame),
    /// Reads client frames until a close arrives, then echoes it.
    AwaitClose,
    /// Drops the connection without a close frame.
    Hangup,
}

/// What the server saw from the client.
#[derive(Debug, Default)]
pub struct Seen {
    pub request: String,
    pub frames: Vec<Frame>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    handle: JoinHandle<Seen>,
}

impl TestServer {
    pub async fn finish(self) -> Seen {
        self.handle.await.unwrap()
    }
}

pub async fn spawn(actions: Vec<ServerAction>) -> TestServer {
    spawn_inner(actions, false).await
}

/// Answers the upgrade with a wrong `Sec-WebSocket-Accept`.
pub async fn spawn_with_bad_accept() -> TestServer {
    spawn_inner(vec![], true).await
}

async fn spawn_inner(actions: Vec<ServerAction>, bad_accept: bool) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = upgrade(&mut socket, bad_accept).await;
        let mut seen = Seen {
            request,
            frames: Vec::new(),
        };
        if bad_accept {
            return seen;
        }

        let mut buf = BytesMut::new();
        let mut closed = false;
        for action in actions {
            match action {
                ServerAction::Send(frame) => {
                    closed |= frame.opcode == OpCode::Close;
                    write_frame(&mut socket, &frame).await;
                }
                ServerAction::AwaitClose => {
                    read_until_close(&mut socket, &mut buf, &mut seen.frames).await;
                    write_frame(&mut socket, &Frame::close(Some(1000))).await;
                    return seen;
                }
                ServerAction::Hangup => return seen,
            }
        }
        if closed {
            read_until_close(&mut socket, &mut buf, &mut seen.frames).await;
        }
        seen
    });
    TestServer { addr, handle }
}

/// Reads the upgrade request and answers it. Returns the request head.
pub async fn upgrade(socket: &mut TcpStream, bad_accept: bool) -> String {
    let request = read_head(socket).await;
    let key = request
        .split("\r\n")
        .find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| v.trim().to_string())
        })
        .unwrap();
    let accept = if bad_accept {
        handshake::accept_key("not the key")
    } else {
        handshake::accept_key(&key)
    };
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    socket.write_all(response.as_bytes()).await.unwrap();
    request
}

pub async fn write_frame(socket: &mut TcpStream, frame: &Frame) {
    let mut out = BytesMut::new();
    frame.encode(None, &mut out);
    socket.write_all(&out).await.unwrap();
}

/// Reads one frame, or `None` on EOF.
pub async fn read_frame(socket: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
    loop {
        if let Some(frame) = Frame::decode(buf).unwrap() {
            return Some(frame);
        }
        let read = tokio::time::timeout(Duration::from_secs(5), socket.read_buf(buf))
            .await
            .unwrap()
            .unwrap();
        if read == 0 {
            return None;
        }
    }
}

async fn read_until_close(socket: &mut TcpStream, buf: &mut BytesMut, frames: &mut Vec<Frame>) {
    while let Some(frame) = read_frame(socket, buf).await {
        let done = frame.opcode == OpCode::Close;
        frames.push(frame);
        if done {
            return;
        }
    }
}
