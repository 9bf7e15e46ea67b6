// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! HTTP CONNECT tunneling.
//!
//! When a proxy is configured, the client connects the socket to the proxy
//! and asks it to splice a tunnel to the real target before any protocol
//! bytes flow. The target host goes to the proxy verbatim, so names the
//! local resolver cannot resolve still work when the proxy can resolve
//! them.
//!
//! The response parser is deliberately lenient: any `HTTP/1.x` status line
//! carrying a 200 code is success, whatever the reason phrase. Headers are
//! consumed up to the blank line one byte at a time; reading ahead of the
//! blank line would swallow protocol bytes that belong to the tunneled
//! stream.

use std::io::{Read, Write};

use crate::addr::SocketAddress;
use crate::error::{Result, TransportError};

/// Longest status/header line accepted from a proxy.
const MAX_LINE: usize = 8 * 1024;

/// Issue a CONNECT request for `target` and consume the proxy response.
/// On return the stream carries tunneled bytes only.
pub fn establish_tunnel<S: Read + Write>(stream: &mut S, target: &SocketAddress) -> Result<()> {
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let status = read_line(stream)?;
    if !is_success_status(&status) {
        return Err(TransportError::Proxy(format!(
            "proxy refused CONNECT to {}: {}",
            target,
            status.trim()
        )));
    }

    // Skip headers up to the blank line
    loop {
        let line = read_line(stream)?;
        if line.trim().is_empty() {
            return Ok(());
        }
    }
}

/// Accept any HTTP/1.0 or HTTP/1.1 status line with code 200.
fn is_success_status(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let version_ok = matches!(parts.next(), Some(v) if v.starts_with("HTTP/1."));
    version_ok && parts.next() == Some("200")
}

/// Read one CRLF-terminated line, one byte at a time.
fn read_line<S: Read>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(TransportError::Proxy(
                "proxy closed connection during CONNECT handshake".into(),
            ));
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).map_err(|_| {
                TransportError::Proxy("non-UTF-8 bytes in proxy response".into())
            });
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(TransportError::Proxy("proxy response line too long".into()));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Duplex double: scripted response bytes in, request bytes captured.
    struct ScriptedProxy {
        response: io::Cursor<Vec<u8>>,
        request: Vec<u8>,
    }

    impl ScriptedProxy {
        fn new(response: &str) -> Self {
            Self {
                response: io::Cursor::new(response.as_bytes().to_vec()),
                request: Vec::new(),
            }
        }
    }

    impl Read for ScriptedProxy {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for ScriptedProxy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.request.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn target() -> SocketAddress {
        SocketAddress::new("feed.example.com", 7400)
    }

    #[test]
    fn test_tunnel_success_leaves_payload_untouched() {
        let mut proxy = ScriptedProxy::new(
            "HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\nPAYLOAD",
        );
        establish_tunnel(&mut proxy, &target()).unwrap();

        // The next read must see the tunneled payload, not header residue
        let mut rest = Vec::new();
        proxy.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"PAYLOAD");

        let request = String::from_utf8(proxy.request).unwrap();
        assert!(request.starts_with("CONNECT feed.example.com:7400 HTTP/1.1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_tunnel_lenient_about_reason_phrase() {
        let mut proxy = ScriptedProxy::new("HTTP/1.0 200\r\n\r\n");
        establish_tunnel(&mut proxy, &target()).unwrap();
    }

    #[test]
    fn test_tunnel_rejects_non_200() {
        let mut proxy = ScriptedProxy::new("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n");
        let err = establish_tunnel(&mut proxy, &target()).unwrap_err();
        assert!(matches!(err, TransportError::Proxy(_)));
        assert!(err.to_string().contains("407"));
    }

    #[test]
    fn test_tunnel_rejects_garbage_status() {
        let mut proxy = ScriptedProxy::new("SOCKS5 nope\r\n\r\n");
        assert!(establish_tunnel(&mut proxy, &target()).is_err());
    }

    #[test]
    fn test_tunnel_detects_early_close() {
        let mut proxy = ScriptedProxy::new("HTTP/1.1 200 OK\r\nVia: test");
        assert!(establish_tunnel(&mut proxy, &target()).is_err());
    }

    #[test]
    fn test_ipv6_target_is_bracketed() {
        let mut proxy = ScriptedProxy::new("HTTP/1.1 200 OK\r\n\r\n");
        establish_tunnel(&mut proxy, &SocketAddress::new("::1", 7400)).unwrap();
        let request = String::from_utf8(proxy.request).unwrap();
        assert!(request.starts_with("CONNECT [::1]:7400 HTTP/1.1\r\n"));
    }
}
