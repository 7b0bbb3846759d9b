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
//! A single persistent connection to a backend server (§4.3).
//!
//! Drives the `Read -> WantRead -> ReadEnd -> Next` response state machine
//! described in Design Notes over one socket, in the same spirit as the
//! source's `BackendConnection`: poll whatever's in flight, and whenever
//! there's room, take the next piece of work. Here "poll whatever's in
//! flight" is a `tokio::select!` between accepting new requests to write and
//! reading the next queued response, rather than a generic `Processor`.
use crate::backend::pending_io::{PendingIO, PendingIoArena};
use crate::errors::BackendError;
use crate::protocol::response::{self, Response, ResponseKind};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Commands a connection reports back to its supervisor.
pub enum BackendCommand {
    Error,
}

pub struct BackendConnection {
    address: SocketAddr,
    request_rx: mpsc::UnboundedReceiver<PendingIO>,
    command_tx: mpsc::UnboundedSender<BackendCommand>,
    timeout: Duration,
}

impl BackendConnection {
    pub fn new(
        address: SocketAddr, request_rx: mpsc::UnboundedReceiver<PendingIO>,
        command_tx: mpsc::UnboundedSender<BackendCommand>, timeout: Duration,
    ) -> BackendConnection {
        BackendConnection { address, request_rx, command_tx, timeout }
    }

    /// Runs forever: connect, drive requests until the socket fails, report
    /// the failure, and (if the request channel is still open) try again.
    /// Actual retry pacing is the supervisor's job, via `BackendHealth`.
    pub async fn run(mut self) {
        loop {
            let stream = match TcpStream::connect(self.address).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(address = %self.address, error = %e, "backend connect failed");
                    let _ = self.command_tx.send(BackendCommand::Error);
                    if self.request_rx.is_closed() {
                        return;
                    }
                    continue;
                },
            };

            match self.drive(stream).await {
                Ok(()) => return, // request channel closed, shut down cleanly
                Err(e) => {
                    warn!(address = %self.address, error = %e, "backend connection failed");
                    let _ = self.command_tx.send(BackendCommand::Error);
                },
            }

            if self.request_rx.is_closed() {
                return;
            }
        }
    }

    async fn drive(&mut self, stream: TcpStream) -> Result<(), BackendError> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut arena = PendingIoArena::new();
        let mut read_buf = BytesMut::with_capacity(16 * 1024);

        let result = loop {
            tokio::select! {
                maybe_io = self.request_rx.recv() => {
                    match maybe_io {
                        Some(io) => {
                            if let Err(e) = writer.write_all(&io.request).await {
                                let _ = io.reply_to.send(Err(BackendError::Io(e)));
                                break Err(BackendError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write failed")));
                            }
                            arena.submit(io);
                        }
                        None => break Ok(()),
                    }
                }
                timed = tokio::time::timeout(self.timeout, read_one_response(&mut reader, &mut read_buf)), if !arena.is_empty() => {
                    match timed {
                        Ok(Ok(response)) => {
                            if let Some(io) = arena.pop_front() {
                                let _ = io.reply_to.send(Ok(response));
                            }
                        }
                        Ok(Err(e)) => break Err(e),
                        Err(_elapsed) => break Err(BackendError::Timeout),
                    }
                }
            }
        };

        // Whatever is still outstanding failed along with the connection.
        // Queued IOs get the same error the connection itself is failing
        // with, not a generic one, so e.g. a timed-out request still gets
        // `SERVER_ERROR backend timeout\r\n` rather than a catch-all reply.
        for io in arena.drain() {
            let err = match &result {
                Err(BackendError::Timeout) => BackendError::Timeout,
                Err(BackendError::Desync) => BackendError::Desync,
                _ => BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "backend connection closed with requests in flight",
                )),
            };
            let _ = io.reply_to.send(Err(err));
        }

        result
    }
}

/// Reads and classifies exactly one backend response, implementing the
/// `Read -> WantRead -> ReadEnd -> Next` transitions against `buf`, which may
/// already hold the start of (or all of) the next pipelined response.
async fn read_one_response(
    reader: &mut (impl tokio::io::AsyncRead + Unpin), buf: &mut BytesMut,
) -> Result<Response, BackendError> {
    // Read: accumulate until a full header line is present.
    let header = loop {
        if let Some(h) = response::parse_header(buf)? {
            break h;
        }
        read_more(reader, buf).await?;
    };

    // WantRead: accumulate the header line plus its value payload, if any.
    let needed = header.reslen + header.vlen;
    while buf.len() < needed {
        read_more(reader, buf).await?;
    }
    let mut out = buf.split_to(needed);

    // ReadEnd: a GET's value is followed by a standalone END line. Anything
    // else there is a desync -- the backend and this proxy disagree about
    // framing and the connection cannot be trusted further.
    if header.kind == ResponseKind::Get {
        loop {
            if buf.len() >= crate::protocol::END_MARKER.len() {
                if &buf[..crate::protocol::END_MARKER.len()] == crate::protocol::END_MARKER {
                    let _ = buf.split_to(crate::protocol::END_MARKER.len());
                    break;
                } else {
                    debug!("backend stream desync: expected END after GET value");
                    return Err(BackendError::Desync);
                }
            }
            read_more(reader, buf).await?;
        }
        out.extend_from_slice(crate::protocol::END_MARKER);
    }

    Ok(Response { header, buffer: out, value_read: header.vlen })
}

async fn read_more(reader: &mut (impl tokio::io::AsyncRead + Unpin), buf: &mut BytesMut) -> Result<(), BackendError> {
    let n = reader.read_buf(buf).await.map_err(BackendError::Io)?;
    if n == 0 {
        return Err(BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "backend closed the connection",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_get_hit_and_appends_end_marker() {
        let wire = b"VALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let resp = read_one_response(&mut reader, &mut buf).await.unwrap();
        assert_eq!(resp.header.kind, ResponseKind::Get);
        assert!(resp.buffer.ends_with(b"END\r\n"));
        assert!(resp.buffer.starts_with(b"VALUE foo 0 3\r\nbar\r\n"));
    }

    #[tokio::test]
    async fn reads_get_miss() {
        let wire = b"END\r\n".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let resp = read_one_response(&mut reader, &mut buf).await.unwrap();
        assert_eq!(resp.header.kind, ResponseKind::End);
        assert_eq!(&resp.buffer[..], b"END\r\n");
    }

    #[tokio::test]
    async fn reads_generic_stored() {
        let wire = b"STORED\r\n".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let resp = read_one_response(&mut reader, &mut buf).await.unwrap();
        assert_eq!(resp.header.kind, ResponseKind::Generic);
        assert_eq!(&resp.buffer[..], b"STORED\r\n");
    }

    #[tokio::test]
    async fn desync_after_get_value_is_rejected() {
        let wire = b"VALUE foo 0 3\r\nbar\r\nSTORED\r\n".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let err = read_one_response(&mut reader, &mut buf).await.unwrap_err();
        assert!(matches!(err, BackendError::Desync));
    }

    #[tokio::test]
    async fn handles_pipelined_responses_leaving_remainder_buffered() {
        let wire = b"STORED\r\nDELETED\r\n".to_vec();
        let mut reader = BufReader::new(&wire[..]);
        let mut buf = BytesMut::new();
        let first = read_one_response(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&first.buffer[..], b"STORED\r\n");
        let second = read_one_response(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&second.buffer[..], b"DELETED\r\n");
    }

    #[tokio::test]
    async fn timeout_drains_queued_ios_with_a_timeout_error_not_a_generic_one() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await
        });

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (command_tx, _command_rx) = mpsc::unbounded_channel();
        let mut conn = BackendConnection::new(addr, request_rx, command_tx, Duration::from_millis(20));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        request_tx
            .send(PendingIO { request: Bytes::from_static(b"get foo\r\n"), reply_to: reply_tx })
            .unwrap();

        let result = conn.drive(stream).await;
        assert!(matches!(result, Err(BackendError::Timeout)));
        match reply_rx.await.unwrap() {
            Err(BackendError::Timeout) => {},
            other => panic!("expected queued IO to fail with Timeout, got {:?}", other),
        }
    }
}
