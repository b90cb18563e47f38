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

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use ring::digest;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use super::Error;
use crate::socket;

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

pub fn generate_key() -> String {
    let key: [u8; 16] = rand::random();
    STANDARD.encode(key)
}

/// The `Sec-WebSocket-Accept` value a server must answer `key` with.
pub fn accept_key(key: &str) -> String {
    let hash = digest::digest(
        &digest::SHA1_FOR_LEGACY_USE_ONLY,
        format!("{key}{ACCEPT_GUID}").as_bytes(),
    );
    STANDARD.encode(hash.as_ref())
}

pub fn request(url: &Url, key: &str, headers: &[(String, String)]) -> Result<String, Error> {
    let host = socket::host_of(url)?;
    let host = match url.port() {
        Some(port) => socket::authority(&host, port),
        None if host.contains(':') => format!("[{host}]"),
        None => host,
    };
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    Ok(request)
}

/// Reads the HTTP response head into `buf`. Returns the head, leaving any bytes that
/// followed it in `buf`.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<String, Error> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(end + 4);
            return Ok(String::from_utf8_lossy(&head).into_owned());
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Handshake("response head too large".to_string()));
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(Error::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
    }
}

/// Checks the server's upgrade response against the key we sent.
pub fn validate_response(head: &str, key: &str) -> Result<(), Error> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if status != Some("101") {
        return Err(Error::Handshake(format!(
            "unexpected response status: {status_line}"
        )));
    }

    let header = |name: &str| {
        head.split("\r\n").skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    };
    if !header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(Error::Handshake("missing Upgrade: websocket".to_string()));
    }
    if !header("connection").is_some_and(|v| {
        v.split(',')
            .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
    }) {
        return Err(Error::Handshake("missing Connection: Upgrade".to_string()));
    }
    match header("sec-websocket-accept") {
        Some(accept) if accept == accept_key(key) => Ok(()),
        Some(_) => Err(Error::Handshake(
            "invalid Sec-WebSocket-Accept".to_string(),
        )),
        None => Err(Error::Handshake(
            "missing Sec-WebSocket-Accept".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn keys_are_random() {
        let a = generate_key();
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 16);
        assert_ne!(a, generate_key());
    }

    #[test]
    fn request_line() {
        let url = Url::parse("wss://api.example:6443/api/v1/exec?container=c&command=sh").unwrap();
        let req = request(
            &url,
            "key",
            &[("Authorization".to_string(), "Bearer t".to_string())],
        )
        .unwrap();
        assert!(req.starts_with("GET /api/v1/exec?container=c&command=sh HTTP/1.1\r\n"));
        assert!(req.contains("Host: api.example:6443\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: key\r\n"));
        assert!(req.contains("Authorization: Bearer t\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    fn response(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        )
    }

    #[test]
    fn validate() {
        let key = generate_key();
        assert!(validate_response(&response(&accept_key(&key)), &key).is_ok());
        assert!(validate_response(&response("bogus"), &key).is_err());
        assert!(
            validate_response("HTTP/1.1 403 Forbidden\r\n\r\n", &key).is_err()
        );
        let missing = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(validate_response(missing, &key).is_err());
    }

    #[tokio::test]
    async fn head_leaves_trailing_bytes() {
        let mut reader: &[u8] = b"HTTP/1.1 101 OK\r\nA: b\r\n\r\n\x82\x01\x01";
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(head, "HTTP/1.1 101 OK\r\nA: b\r\n\r\n");
        assert_eq!(&buf[..], b"\x82\x01\x01");
    }
}
