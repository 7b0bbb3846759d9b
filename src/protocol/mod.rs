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
//! The memcached text protocol, as spoken by both clients and backends.
pub mod request;
pub mod response;

pub use self::request::{Command, Request};
pub use self::response::{Response, ResponseKind};

/// Trailing marker appended after every forwarded GET value. Exactly 5 bytes
/// -- `"END\r\n"` -- with no NUL terminator to account for.
pub const END_MARKER: &[u8] = b"END\r\n";

pub const ERROR_REPLY: &[u8] = b"ERROR\r\n";

/// Builds a `CLIENT_ERROR <reason>\r\n` reply.
pub fn client_error(reason: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + reason.len());
    buf.extend_from_slice(b"CLIENT_ERROR ");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Builds a `SERVER_ERROR <reason>\r\n` reply.
pub fn server_error(reason: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + reason.len());
    buf.extend_from_slice(b"SERVER_ERROR ");
    buf.extend_from_slice(reason.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Maximum length, in bytes, of a command line read without a trailing
/// newline before the connection is given up on (§4.6), unless it looks
/// like the start of a multiget.
pub const MAX_COMMAND_LINE: usize = 1024;
