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
//! Client Connection Adapter (§4.6): parses one command at a time off the
//! socket, drives it through the routing runtime and however many backend
//! round trips it yields, and writes replies back in arrival order.
//!
//! This generalizes `service/pipeline.rs`'s `Pipeline<Transport, Service>`
//! shape to the one service this proxy actually has. There's no `tower`
//! `Service` here -- the routing runtime's `Thread`/`RegistryKey` types are
//! `!Send`, and every worker is already a single OS thread, so the
//! abstraction buys in the general case (driving an arbitrary, possibly
//! cross-thread backend) has nothing to generalize over here. What's kept is the
//! same job `Pipeline::pending` did: hold completed replies in arrival
//! order while letting later ones finish before earlier ones if a backend
//! answers out of turn.
use crate::backend::Backend;
use crate::errors::{BackendError, ProtocolError, RoutingError};
use crate::io_queue::IoQueue;
use crate::protocol::{self, request::Request};
use crate::routing::lua::{LuaRuntime, Resumption};
use bytes::BytesMut;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// A command line may grow past `MAX_COMMAND_LINE` only while it still looks
/// like the start of a multiget (§4.6); even then it's bounded, so one very
/// wide `get` can't pin the connection's read buffer forever.
const MAX_MULTIGET_LINE: usize = 64 * 1024;

type Reply = Vec<u8>;
type PendingReply = Pin<Box<dyn Future<Output = Reply>>>;

/// One accepted client socket, paired with the worker-wide routing runtime
/// and backend registry it was accepted under.
pub struct ClientConnection {
    socket: TcpStream,
    lua: Rc<LuaRuntime>,
    backends: Rc<HashMap<String, Backend>>,
}

impl ClientConnection {
    pub fn new(socket: TcpStream, lua: Rc<LuaRuntime>, backends: Rc<HashMap<String, Backend>>) -> ClientConnection {
        ClientConnection { socket, lua, backends }
    }

    /// Drives the connection until the client disconnects or a fatal
    /// protocol error closes it. Never panics on a misbehaving peer.
    pub async fn run(self) {
        let (mut reader, mut writer) = self.socket.into_split();
        let lua = self.lua;
        let backends = self.backends;
        let io_queue = Rc::new(RefCell::new(IoQueue::new()));

        let mut read_buf = BytesMut::with_capacity(4096);
        let mut pending: FuturesOrdered<PendingReply> = FuturesOrdered::new();
        let mut closed = false;

        loop {
            tokio::select! {
                biased;

                Some(reply) = pending.next(), if !pending.is_empty() => {
                    if writer.write_all(&reply).await.is_err() {
                        break;
                    }
                },

                result = next_request(&mut reader, &mut read_buf), if !closed => {
                    match result {
                        Ok(Some(request)) => {
                            let fut = drive_request(lua.clone(), backends.clone(), io_queue.clone(), request);
                            pending.push_back(Box::pin(fut));
                        },
                        Ok(None) => {
                            debug!("client closed connection");
                            closed = true;
                        },
                        Err(e) => {
                            let fatal = matches!(e, ProtocolError::LineTooLong);
                            if writer.write_all(&protocol_error_reply(&e)).await.is_err() || fatal {
                                closed = true;
                            }
                        },
                    }
                },

                else => break,
            }
        }

        // Let whatever's still in flight finish and go out, then release
        // anything left suspended -- the wire has no way to cancel a
        // backend request already on its way, so its reply is simply
        // discarded (§4.2 "Cancellation", §5 "Cancellation").
        while let Some(reply) = pending.next().await {
            if writer.write_all(&reply).await.is_err() {
                break;
            }
        }
        io_queue.borrow_mut().finalize_all();
    }
}

/// Reads the next complete command line (and, if the command carries one,
/// its value payload) off `reader`, buffering partial reads in `buf`.
///
/// Returns `Ok(None)` on EOF, whether or not a partial command is sitting in
/// `buf` -- a half-read command can never be completed once the peer has
/// closed, so it's treated the same as a clean close rather than a
/// recoverable parse error.
async fn next_request<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R, buf: &mut BytesMut,
) -> Result<Option<Request>, ProtocolError> {
    let line = loop {
        if let Some(idx) = find_crlf(buf) {
            break buf.split_to(idx + 2).freeze();
        }

        if buf.len() > protocol::MAX_COMMAND_LINE && !looks_like_multiget(buf) {
            return Err(ProtocolError::LineTooLong);
        }
        if buf.len() > MAX_MULTIGET_LINE {
            return Err(ProtocolError::LineTooLong);
        }

        if reader.read_buf(buf).await.map_err(|_| ProtocolError::LineTooLong)? == 0 {
            // Peer closed (at least its write half). A residual buffer here
            // is a command that will never be completed, not a malformed one
            // worth a CLIENT_ERROR reply and another read attempt -- the next
            // read would just observe EOF again and spin.
            return Ok(None);
        }
    };

    let mut request = Request::parse(line)?;
    let needed = request.pending_value_len();
    if needed > 0 {
        while buf.len() < needed {
            if reader.read_buf(buf).await.map_err(|_| ProtocolError::Malformed("connection closed mid-value"))? == 0 {
                return Ok(None);
            }
        }
        let value = buf.split_to(needed).freeze();
        request.attach_value(value)?;
    }

    Ok(Some(request))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// The 1 KiB line-length limit doesn't apply to a buffered prefix that still
/// looks like `get <key> <key> ...` or `gets <key> <key> ...` (§4.6).
fn looks_like_multiget(buf: &[u8]) -> bool {
    buf.starts_with(b"get ") || buf.starts_with(b"gets ")
}

/// Drives one parsed request through the routing runtime to completion,
/// making as many backend round trips as the script's coroutine yields for
/// (§4.2 "Resumption"). Each yield replaces the previous `IoQueue` entry
/// with a new one on the same reply.
async fn drive_request(
    lua: Rc<LuaRuntime>, backends: Rc<HashMap<String, Backend>>, io_queue: Rc<RefCell<IoQueue>>, request: Request,
) -> Reply {
    let mut state = lua.start(&request);
    loop {
        state = match state {
            Resumption::Ready(reply) => return reply,
            Resumption::Errored(e) => return routing_error_reply(&e),
            Resumption::Yielded { backend, request: backend_request, coroutine } => {
                let handle = io_queue.borrow_mut().submit(coroutine);

                let backend_conn = backends.get(&backend).cloned();
                let result = match backend_conn {
                    Some(conn) => conn.submit(backend_request).await,
                    None => {
                        io_queue.borrow_mut().finalize(handle);
                        return protocol::server_error(&format!("unknown backend {}", backend));
                    },
                };

                let coroutine = match io_queue.borrow_mut().complete(handle) {
                    Some(key) => key,
                    // Torn down mid-flight: the reply slot is a no-op.
                    None => return Reply::new(),
                };

                match result {
                    Ok(response) => lua.resume(coroutine, &response.buffer[..]),
                    Err(e) => return backend_error_reply(&e),
                }
            },
        };
    }
}

fn protocol_error_reply(e: &ProtocolError) -> Reply {
    protocol::client_error(&e.to_string())
}

fn routing_error_reply(e: &RoutingError) -> Reply {
    match e {
        RoutingError::NoRouteAttached => protocol::server_error("no route attached"),
        RoutingError::Lua(_) => protocol::server_error("lua failure"),
    }
}

fn backend_error_reply(e: &BackendError) -> Reply {
    e.client_reply().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_a_simple_command_line() {
        let wire = b"get foo\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let request = next_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.key(), b"foo");
    }

    #[tokio::test]
    async fn reads_a_set_command_with_its_value() {
        let wire = b"set foo 0 0 3\r\nbar\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let request = next_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.value(), Some(&b"bar\r\n"[..]));
    }

    #[tokio::test]
    async fn clean_eof_with_nothing_buffered_returns_none() {
        let wire: &[u8] = b"";
        let mut reader = BufReader::new(wire);
        let mut buf = BytesMut::new();
        assert!(next_request(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_command_line_is_treated_as_closed_not_malformed() {
        let wire: &[u8] = b"get fo";
        let mut reader = BufReader::new(wire);
        let mut buf = BytesMut::new();
        assert!(next_request(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_value_is_treated_as_closed_not_malformed() {
        let wire: &[u8] = b"set foo 0 0 5\r\nab";
        let mut reader = BufReader::new(wire);
        let mut buf = BytesMut::new();
        assert!(next_request(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlong_line_without_multiget_prefix_is_rejected() {
        let mut wire = b"bogus ".to_vec();
        wire.extend(std::iter::repeat(b'x').take(protocol::MAX_COMMAND_LINE + 10));
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        assert_eq!(next_request(&mut reader, &mut buf).await.unwrap_err(), ProtocolError::LineTooLong);
    }

    #[tokio::test]
    async fn overlong_multiget_prefix_is_tolerated_until_it_terminates() {
        let mut wire = b"get ".to_vec();
        wire.extend(std::iter::repeat(b'x').take(protocol::MAX_COMMAND_LINE + 10));
        wire.extend_from_slice(b"\r\n");
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let request = next_request(&mut reader, &mut buf).await.unwrap().unwrap();
        assert_eq!(request.command(), crate::protocol::Command::Get);
    }
}
