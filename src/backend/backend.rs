// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! A pool of persistent connections to one backend server (§4.3).
//!
//! `Backend` is a thin, cloneable facade over a set of connections spawned
//! as local tasks: `submit` hands a raw request to one of them (round robin)
//! and returns a future that resolves with the parsed response. Connection
//! failures are reported back over a command channel so the backend can
//! track health and recycle connections. No generic `Processor`/`WorkQueue`
//! machinery sits underneath it -- this single-protocol proxy has no use
//! for one.
use crate::backend::connection::{BackendCommand, BackendConnection};
use crate::backend::health::BackendHealth;
use crate::backend::pending_io::PendingIO;
use crate::errors::{BackendError, CreationError};
use crate::protocol::Response;
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

struct BackendOptions {
    conn_limit: usize,
    cooloff_enabled: bool,
    cooloff_timeout_ms: u64,
    cooloff_error_limit: usize,
    timeout_ms: u64,
}

impl BackendOptions {
    fn from_map(mut options: HashMap<String, String>) -> Result<BackendOptions, CreationError> {
        Ok(BackendOptions {
            conn_limit: parse_option(&mut options, "conns", "1")?,
            cooloff_enabled: parse_option(&mut options, "cooloff_enabled", "true")?,
            cooloff_timeout_ms: parse_option(&mut options, "cooloff_timeout_ms", "10000")?,
            cooloff_error_limit: parse_option(&mut options, "cooloff_error_limit", "5")?,
            timeout_ms: parse_option(&mut options, "timeout_ms", "1000")?,
        })
    }
}

fn parse_option<T: FromStr>(options: &mut HashMap<String, String>, key: &str, default: &str) -> Result<T, CreationError> {
    let raw = options.entry(key.to_owned()).or_insert_with(|| default.to_owned());
    T::from_str(raw.as_str()).map_err(|_| CreationError::InvalidParameter(format!("options.{}", key)))
}

struct BackendInner {
    address: SocketAddr,
    senders: Vec<mpsc::UnboundedSender<PendingIO>>,
    next: Cell<usize>,
    health: RefCell<BackendHealth>,
    command_rx: RefCell<mpsc::UnboundedReceiver<BackendCommand>>,
}

/// A backend server, servicing requests through a pool of persistent
/// connections managed as local tasks on this worker's single-threaded
/// runtime. Cheaply cloneable -- every clone shares the same connection
/// pool and health state.
#[derive(Clone)]
pub struct Backend {
    inner: Rc<BackendInner>,
}

impl Backend {
    pub fn new(address: SocketAddr, options: HashMap<String, String>) -> Result<Backend, CreationError> {
        let opts = BackendOptions::from_map(options)?;
        debug!(%address, conns = opts.conn_limit, "configuring backend");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(opts.timeout_ms);

        let mut senders = Vec::with_capacity(opts.conn_limit);
        for _ in 0..opts.conn_limit {
            let (request_tx, request_rx) = mpsc::unbounded_channel();
            let conn = BackendConnection::new(address, request_rx, command_tx.clone(), timeout);
            tokio::task::spawn_local(conn.run());
            senders.push(request_tx);
        }

        let health = BackendHealth::new(opts.cooloff_enabled, opts.cooloff_timeout_ms, opts.cooloff_error_limit);

        Ok(Backend {
            inner: Rc::new(BackendInner {
                address,
                senders,
                next: Cell::new(0),
                health: RefCell::new(health),
                command_rx: RefCell::new(command_rx),
            }),
        })
    }

    /// Drains any pending connection-failure commands, updating health
    /// accounting. Connections reconnect themselves (`BackendConnection::run`
    /// loops internally); this just keeps `is_healthy` accurate.
    pub fn reap_commands(&self) {
        let mut rx = self.inner.command_rx.borrow_mut();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                BackendCommand::Error => self.inner.health.borrow_mut().increment_error(),
            }
        }
    }

    pub fn is_healthy(&self) -> bool { self.inner.health.borrow_mut().is_healthy() }

    pub fn address(&self) -> SocketAddr { self.inner.address }

    /// Writes `request` to this backend and returns a future that resolves
    /// with its parsed response, fulfilling the submit/complete contract the
    /// routing runtime's completion path relies on (§4.2, §6).
    ///
    /// Fails fast with `BackendError::Unavailable` while the backend is in
    /// cooloff (§4.3 "Backend connect failure") instead of queuing the
    /// request behind a socket that `BackendHealth` already expects to keep
    /// failing -- a caller stuck behind a wedged reconnect loop would
    /// otherwise never see a reply.
    pub async fn submit(&self, request: Bytes) -> Result<Response, BackendError> {
        if !self.is_healthy() {
            return Err(BackendError::Unavailable);
        }

        let idx = self.inner.next.get();
        self.inner.next.set((idx + 1) % self.inner.senders.len());

        let (reply_to, rx) = oneshot::channel();
        let io = PendingIO { request, reply_to };
        self.inner.senders[idx]
            .send(io)
            .map_err(|_| BackendError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend shut down")))?;

        rx.await.map_err(|_| BackendError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "backend dropped request")))?
    }
}
