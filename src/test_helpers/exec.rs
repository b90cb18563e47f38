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

//! A WebSocket server speaking the Kubernetes exec channel protocol. Commands run locally
//! with paths under the client certificate location rewritten into a scratch directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use super::ws::{read_frame, upgrade, write_frame};
use crate::exec::Channel;
use crate::inject::CLIENT_CERT_PATH;
use crate::websocket::frame::{Frame, OpCode};

pub const CERT_FILE: &str = "client.pem";

pub struct ExecServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ExecServer {
    /// Serves exec sessions until dropped with the runtime. `root` receives the certificate
    /// as `root/client.pem` and serves as the script's `TMPDIR`.
    pub async fn spawn(root: &Path) -> ExecServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let root = root.to_path_buf();
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                let seen = seen.clone();
                let root = root.clone();
                tokio::spawn(async move { serve(socket, &root, &seen).await });
            }
        });
        ExecServer { addr, requests }
    }

    pub fn api_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Request heads of every session so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(mut socket: TcpStream, root: &Path, seen: &Mutex<Vec<String>>) {
    let request = upgrade(&mut socket, false).await;
    seen.lock().unwrap().push(request.clone());

    let target = request.split_whitespace().nth(1).unwrap();
    let url = Url::parse(&format!("http://exec{target}")).unwrap();
    let commands: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| k == "command")
        .map(|(_, v)| v.into_owned())
        .collect();
    let wants_stdin = url.query_pairs().any(|(k, v)| k == "stdin" && v == "true");

    let mut stdin = Vec::new();
    if wants_stdin {
        let mut buf = BytesMut::new();
        while let Some(frame) = read_frame(&mut socket, &mut buf).await {
            match frame.opcode {
                OpCode::Close => break,
                _ => {
                    if let Some((Ok(Channel::Stdin), data)) = Channel::decode(&frame.payload) {
                        stdin.extend_from_slice(data);
                    }
                }
            }
        }
    }
    let script = String::from_utf8_lossy(&stdin).replace(
        CLIENT_CERT_PATH,
        &root.join(CERT_FILE).display().to_string(),
    );

    let output = run(&commands, script.as_bytes(), root).await;
    for (channel, data) in [
        (Channel::Stdout, &output.stdout),
        (Channel::Stderr, &output.stderr),
    ] {
        if !data.is_empty() {
            write_frame(&mut socket, &Frame::new(OpCode::Binary, channel.encode(data))).await;
        }
    }
    if !output.status.success() {
        let message = format!(
            "command terminated with non-zero exit code: {}",
            output.status.code().unwrap_or(-1)
        );
        write_frame(
            &mut socket,
            &Frame::new(OpCode::Binary, Channel::Error.encode(message.as_bytes())),
        )
        .await;
    }
    write_frame(&mut socket, &Frame::close(Some(1000))).await;
    let _ = socket.shutdown().await;
}

async fn run(commands: &[String], stdin: &[u8], root: &Path) -> std::process::Output {
    let mut child = tokio::process::Command::new(&commands[0])
        .args(&commands[1..])
        .env("TMPDIR", PathBuf::from(root))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut input = child.stdin.take().unwrap();
    input.write_all(stdin).await.unwrap();
    drop(input);
    child.wait_with_output().await.unwrap()
}
