// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Listening socket with a race-free close.
//!
//! The accept thread blocks in `accept` while `close` can arrive from any
//! thread at any moment, including in the middle of `bind`. The acceptor
//! resolves the race with one flag and one mutex scoped strictly to the
//! listener-handle swap, in opposite orders on the two paths:
//!
//! * `bind` stores the handle, then checks the flag; if the flag is set
//!   it takes its own handle back out and shuts it.
//! * `close` sets the flag, then takes the handle and shuts it.
//!
//! Whichever way the steps interleave, exactly one side ends up shutting
//! the listener and no open handle survives a close. Shutdown goes
//! through the shared open file description, so an accept blocked on a
//! cloned handle returns immediately.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Pause after a transient accept error before retrying, so an fd
/// exhaustion burst does not spin the accept thread.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// A bound listening socket and its close protocol.
pub struct ConnectionAcceptor {
    bind_address: IpAddr,
    port: u16,
    backlog: u32,
    listener: Mutex<Option<TcpListener>>,
    local_port: AtomicU32,
    closed: AtomicBool,
}

impl ConnectionAcceptor {
    pub fn new(bind_address: Option<IpAddr>, port: u16, backlog: u32) -> Self {
        Self {
            bind_address: bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port,
            backlog,
            listener: Mutex::new(None),
            local_port: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind and start listening. Fails if the port is taken or the
    /// acceptor was closed, including a close racing this very call.
    pub fn bind(&self) -> io::Result<()> {
        let addr = SocketAddr::new(self.bind_address, self.port);
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.backlog as i32)?;
        let listener: TcpListener = socket.into();
        let local_port = listener.local_addr()?.port();

        // Store the handle, then check the flag; close does the opposite
        *self.listener.lock() = Some(listener);
        self.local_port.store(local_port as u32, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            if let Some(listener) = self.listener.lock().take() {
                shutdown_listener(&listener);
            }
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "acceptor closed during bind",
            ));
        }
        log::info!("Listening on {}:{}", self.bind_address, local_port);
        Ok(())
    }

    /// Actual port after [`bind`], for listeners bound to port 0.
    ///
    /// [`bind`]: ConnectionAcceptor::bind
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire) as u16
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Accept until closed, handing each socket to `on_accept`. Runs on
    /// the dedicated acceptor thread. Transient errors pause and retry;
    /// close ends the loop.
    pub fn accept_loop(&self, mut on_accept: impl FnMut(TcpStream, SocketAddr)) {
        let listener = {
            let guard = self.listener.lock();
            match guard.as_ref().map(TcpListener::try_clone) {
                Some(Ok(listener)) => listener,
                Some(Err(e)) => {
                    log::error!("Cannot clone listener handle: {}", e);
                    return;
                }
                None => return,
            }
        };

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_closed() {
                        break;
                    }
                    on_accept(stream, peer);
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    log::warn!("Cannot accept connection: {}", e);
                    std::thread::sleep(ACCEPT_ERROR_PAUSE);
                }
            }
        }
    }

    /// Stop listening and unblock the accept thread. Idempotent.
    pub fn close(&self) {
        // Set the flag, then take the handle; bind does the opposite
        self.closed.store(true, Ordering::Release);
        if let Some(listener) = self.listener.lock().take() {
            shutdown_listener(&listener);
        }
    }
}

/// Shut the listening socket down on its open file description so every
/// clone, including the one the accept thread blocks on, wakes up.
fn shutdown_listener(listener: &TcpListener) {
    let _ = SockRef::from(listener).shutdown(std::net::Shutdown::Both);
}

// ============================================================================
// Tests
// ============================================================================
