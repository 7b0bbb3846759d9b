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
use std::fmt;

/// Errors encountered while building a worker out of its configuration.
#[derive(Debug)]
pub enum CreationError {
    InvalidParameter(String),
    InvalidResource(String),
    Io(std::io::Error),
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationError::InvalidParameter(s) => write!(f, "invalid parameter: {}", s),
            CreationError::InvalidResource(s) => write!(f, "invalid resource: {}", s),
            CreationError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for CreationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CreationError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CreationError {
    fn from(e: std::io::Error) -> Self { CreationError::Io(e) }
}

/// Errors produced while turning raw client bytes into a `Request` (§4.1).
///
/// These are always recoverable from the connection's point of view: the
/// client adapter replies `CLIENT_ERROR ...\r\n` and keeps reading.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command line had no recognized command token.
    UnknownCommand,
    /// A command that requires more tokens than were present.
    Malformed(&'static str),
    /// A numeric field (flags, exptime, vlen) failed to parse.
    InvalidNumber(&'static str),
    /// `vlen` was negative or exceeded `i32::MAX - 2`.
    ValueTooLarge,
    /// The command line exceeded 1 KiB without a trailing newline and wasn't
    /// a `get`/`gets` prefix, so the connection must close (§4.6).
    LineTooLong,
    /// A value payload didn't end in `\r\n`.
    BadValueTrailer,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownCommand => write!(f, "unknown command"),
            ProtocolError::Malformed(field) => write!(f, "malformed request: {}", field),
            ProtocolError::InvalidNumber(field) => write!(f, "bad command line format: {}", field),
            ProtocolError::ValueTooLarge => write!(f, "value too large"),
            ProtocolError::LineTooLong => write!(f, "command line too long"),
            ProtocolError::BadValueTrailer => write!(f, "bad data chunk"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors surfaced from the backend response state machine (§4.3).
#[derive(Debug)]
pub enum BackendError {
    /// The socket was closed, reset, or otherwise failed at the OS level.
    Io(std::io::Error),
    /// A response kind this proxy doesn't understand came back on the wire.
    UnknownResponseKind,
    /// The stream desynced: something other than `END\r\n` followed a GET value.
    Desync,
    /// The backend didn't respond within the per-backend timeout.
    Timeout,
    /// The backend connection itself could not be established.
    ConnectFailed(std::io::Error),
    /// The backend is in cooloff after too many consecutive errors (§4.3,
    /// §9 "Backend retry policy") and was not even attempted.
    Unavailable,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Io(e) => write!(f, "backend i/o error: {}", e),
            BackendError::UnknownResponseKind => write!(f, "unhandled backend response kind"),
            BackendError::Desync => write!(f, "backend stream desynced"),
            BackendError::Timeout => write!(f, "backend timeout"),
            BackendError::ConnectFailed(e) => write!(f, "backend connect failed: {}", e),
            BackendError::Unavailable => write!(f, "backend unavailable (in cooloff)"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::Io(e) => Some(e),
            BackendError::ConnectFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl BackendError {
    /// The client-visible reply for this error, per §7.
    pub fn client_reply(&self) -> &'static [u8] {
        match self {
            BackendError::Timeout => b"SERVER_ERROR backend timeout\r\n",
            BackendError::Desync => b"SERVER_ERROR backend desync\r\n",
            BackendError::Unavailable => b"SERVER_ERROR backend unavailable\r\n",
            _ => b"SERVER_ERROR backend failure\r\n",
        }
    }
}

/// Errors produced by the routing runtime (§4.2).
#[derive(Debug)]
pub enum RoutingError {
    Lua(mlua::Error),
    NoRouteAttached,
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::Lua(e) => write!(f, "lua failure: {}", e),
            RoutingError::NoRouteAttached => write!(f, "no route attached for this command"),
        }
    }
}

impl std::error::Error for RoutingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RoutingError::Lua(e) => Some(e),
            RoutingError::NoRouteAttached => None,
        }
    }
}

impl From<mlua::Error> for RoutingError {
    fn from(e: mlua::Error) -> Self { RoutingError::Lua(e) }
}

/// Unifies the crate's error enums for callers that don't care which stage
/// failed (config loading, mainly -- request/backend/routing errors are
/// otherwise handled inline and turned into client replies, never bubbled
/// up as a `ProxyError`).
#[derive(Debug)]
pub enum ProxyError {
    Creation(CreationError),
    Protocol(ProtocolError),
    Backend(BackendError),
    Routing(RoutingError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Creation(e) => write!(f, "{}", e),
            ProxyError::Protocol(e) => write!(f, "{}", e),
            ProxyError::Backend(e) => write!(f, "{}", e),
            ProxyError::Routing(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Creation(e) => Some(e),
            ProxyError::Protocol(e) => Some(e),
            ProxyError::Backend(e) => Some(e),
            ProxyError::Routing(e) => Some(e),
        }
    }
}

impl From<CreationError> for ProxyError {
    fn from(e: CreationError) -> Self { ProxyError::Creation(e) }
}

impl From<ProtocolError> for ProxyError {
    fn from(e: ProtocolError) -> Self { ProxyError::Protocol(e) }
}

impl From<BackendError> for ProxyError {
    fn from(e: BackendError) -> Self { ProxyError::Backend(e) }
}

impl From<RoutingError> for ProxyError {
    fn from(e: RoutingError) -> Self { ProxyError::Routing(e) }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
