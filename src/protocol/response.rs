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
//! Backend response header classification (§4.3).
use crate::errors::BackendError;
use bytes::BytesMut;

/// Classification of a single backend response header line, mirroring
/// response header shape: a value-bearing GET, a bare END, a self-contained
/// meta reply, or a generic single-line reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// `VALUE <key> <flags> <bytes>\r\n`, followed by `<bytes>` bytes of
    /// value data plus a trailing CRLF, and (for this proxy, which issues
    /// one key per backend GET) a standalone `END\r\n` afterwards.
    Get,
    /// A bare `END\r\n` -- either a GET miss or a stats terminator.
    End,
    /// A meta-protocol response (`HD`, `EN`, `NF`, `NS`, `EX`, or `VA <size>
    /// ...` carrying its own value).
    Meta,
    /// Any other self-contained single-line response (`STORED`, `DELETED`,
    /// `NOT_FOUND`, `ERROR`, `CLIENT_ERROR ...`, `SERVER_ERROR ...`, ...).
    Generic,
}

/// The parsed shape of a response header: how many bytes make up the header
/// line itself, and how many bytes of value data (including its own
/// trailing CRLF) follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub kind: ResponseKind,
    pub reslen: usize,
    pub vlen: usize,
}

/// Scans `buf` for a complete header line and classifies it.
///
/// Returns `Ok(None)` if `buf` doesn't yet contain a full line -- the caller
/// should read more and retry. Returns `Err` for a line that doesn't match any known
/// response shape (§4.3 "Unknown kind").
pub fn parse_header(buf: &[u8]) -> Result<Option<ResponseHeader>, BackendError> {
    let line_end = match find_crlf(buf) {
        Some(idx) => idx,
        None => return Ok(None),
    };
    let reslen = line_end + 2;
    let line = &buf[..line_end];

    if line == b"END" {
        return Ok(Some(ResponseHeader {
            kind: ResponseKind::End,
            reslen,
            vlen: 0,
        }));
    }

    if let Some(rest) = line.strip_prefix(b"VALUE ") {
        let bytes_field = nth_field(rest, 2).ok_or(BackendError::UnknownResponseKind)?;
        let data_len: usize = btoi::btoi(bytes_field).map_err(|_| BackendError::UnknownResponseKind)?;
        return Ok(Some(ResponseHeader {
            kind: ResponseKind::Get,
            reslen,
            vlen: data_len + 2,
        }));
    }

    if let Some(rest) = line.strip_prefix(b"VA ") {
        let size_field = nth_field(rest, 0).ok_or(BackendError::UnknownResponseKind)?;
        let data_len: usize = btoi::btoi(size_field).map_err(|_| BackendError::UnknownResponseKind)?;
        return Ok(Some(ResponseHeader {
            kind: ResponseKind::Meta,
            reslen,
            vlen: data_len + 2,
        }));
    }

    // Self-contained meta codes: two-letter prefix, no value payload.
    const META_CODES: &[&[u8]] = &[b"HD", b"EN", b"NF", b"NS", b"EX"];
    for code in META_CODES {
        if line == *code || line.starts_with(&[code, &b" "[..]].concat()[..]) {
            return Ok(Some(ResponseHeader {
                kind: ResponseKind::Meta,
                reslen,
                vlen: 0,
            }));
        }
    }

    // Anything else self-contained and line-shaped is treated as a generic
    // reply forwarded verbatim: STORED, NOT_STORED, DELETED, NOT_FOUND,
    // EXISTS, OK, TOUCHED, ERROR, CLIENT_ERROR ..., SERVER_ERROR ...
    if !line.is_empty() {
        return Ok(Some(ResponseHeader {
            kind: ResponseKind::Generic,
            reslen,
            vlen: 0,
        }));
    }

    Err(BackendError::UnknownResponseKind)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Returns the `n`th (0-indexed) space-delimited field of `buf`.
fn nth_field(buf: &[u8], n: usize) -> Option<&[u8]> {
    buf.split(|&b| b == b' ').filter(|f| !f.is_empty()).nth(n)
}

/// An in-progress or completed backend response, owning its own reply
/// buffer independently of the backend's read buffer (§3, `Response`) so it
/// can outlive it and hand off to the client reply.
#[derive(Debug)]
pub struct Response {
    pub header: ResponseHeader,
    pub buffer: BytesMut,
    /// Bytes of the value portion copied so far (excludes the header line,
    /// which is always copied in full up front).
    pub value_read: usize,
}

impl Response {
    pub fn new(header: ResponseHeader) -> Response {
        let mut extra = 0;
        if header.kind == ResponseKind::Get {
            extra = crate::protocol::END_MARKER.len();
        }
        Response {
            header,
            buffer: BytesMut::with_capacity(header.reslen + header.vlen + extra),
            value_read: 0,
        }
    }

    pub fn total_value_len(&self) -> usize { self.header.vlen }

    pub fn value_complete(&self) -> bool { self.value_read >= self.header.vlen }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_hit_header() {
        let h = parse_header(b"VALUE foo 0 3\r\nbar\r\n").unwrap().unwrap();
        assert_eq!(h.kind, ResponseKind::Get);
        assert_eq!(h.reslen, b"VALUE foo 0 3\r\n".len());
        assert_eq!(h.vlen, 5); // 3 bytes + CRLF
    }

    #[test]
    fn parses_end_as_miss() {
        let h = parse_header(b"END\r\n").unwrap().unwrap();
        assert_eq!(h.kind, ResponseKind::End);
        assert_eq!(h.vlen, 0);
    }

    #[test]
    fn parses_generic_stored() {
        let h = parse_header(b"STORED\r\n").unwrap().unwrap();
        assert_eq!(h.kind, ResponseKind::Generic);
        assert_eq!(h.vlen, 0);
    }

    #[test]
    fn parses_meta_value() {
        let h = parse_header(b"VA 3 c1\r\nbar\r\n").unwrap().unwrap();
        assert_eq!(h.kind, ResponseKind::Meta);
        assert_eq!(h.vlen, 5);
    }

    #[test]
    fn parses_meta_self_contained() {
        let h = parse_header(b"HD\r\n").unwrap().unwrap();
        assert_eq!(h.kind, ResponseKind::Meta);
        assert_eq!(h.vlen, 0);
    }

    #[test]
    fn incomplete_line_returns_none() {
        assert_eq!(parse_header(b"VALUE foo 0 3").unwrap(), None);
    }
}
