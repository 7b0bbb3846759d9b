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
use crate::errors::ProtocolError;
use bytes::Bytes;
use std::ops::Range;

/// Numeric command codes routed through the proxy (§4.1, §6).
///
/// This is exactly the set the dispatch-by-length-then-memcmp scan
/// recognizes; other wire commands (`gets`, `add`, `cas`, `incr`, ...) are
/// forwarded by whatever routing function the script attaches for
/// `Hook::Any`, but are never individually parsed out by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Mg,
    Ms,
    Md,
    Mn,
    Ma,
    Me,
    Get,
    Set,
    Delete,
}

/// Value-payload fields for mutation commands (§3, `set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueMeta {
    pub flags: u32,
    pub exptime: i32,
    /// Already adjusted to include the trailing CRLF (i.e. `bytes + 2`).
    pub vlen: i32,
}

/// A parsed client (or backend-bound) command line, plus its optional value.
///
/// `raw` is a cheaply-cloneable view over the bytes the command line and
/// value arrived in; token ranges index into it. Cloning a `Request` never
/// copies the underlying bytes (see Design Notes §9, "Buffer ownership
/// across async boundaries").
#[derive(Debug, Clone)]
pub struct Request {
    raw: Bytes,
    command_range: Range<usize>,
    key_range: Option<Range<usize>>,
    command: Command,
    value_meta: Option<ValueMeta>,
    value: Option<Bytes>,
}

/// `vlen` must fit in a positive `i32` after the `+2` CRLF adjustment.
const MAX_VLEN: i64 = i32::MAX as i64 - 2;

impl Request {
    /// Parses a single CRLF-terminated command line (the CRLF is included in
    /// `line`, per `cmdlen` in `process_request()`).
    ///
    /// Token splitting is a single left-to-right scan: walk forward through
    /// the first `cmdlen - 2` bytes (the
    /// trailing CRLF is never scanned), splitting on spaces into at most two
    /// slots (command, key). Once both slots are full the scan stops
    /// immediately, leaving `cur` pointing just past the second delimiter so
    /// per-command code (e.g. `set`'s flags/exptime/bytes) can keep parsing
    /// from there without re-scanning the key.
    pub fn parse(line: Bytes) -> Result<Request, ProtocolError> {
        if line.len() < 2 {
            return Err(ProtocolError::Malformed("empty command line"));
        }

        let body_len = line.len() - 2; // strip trailing CRLF
        let mut tokens: [Range<usize>; 2] = [0..0, 0..0];
        let mut ntokens = 0usize;
        let mut cur = 0usize;
        let mut s = 0usize;

        while cur < body_len {
            if line[cur] == b' ' {
                tokens[ntokens] = s..cur;
                ntokens += 1;
                if ntokens == 2 {
                    cur += 1;
                    s = cur;
                    break;
                }
                s = cur + 1;
            }
            cur += 1;
        }
        if s != cur && ntokens < 2 {
            tokens[ntokens] = s..cur;
            ntokens += 1;
        }

        if ntokens == 0 {
            return Err(ProtocolError::Malformed("no tokens"));
        }

        let command_range = tokens[0].clone();
        let key_range = if ntokens > 1 { Some(tokens[1].clone()) } else { None };
        let cmd_bytes = &line[command_range.clone()];

        let (command, value_meta) = classify(cmd_bytes, &line, cur, ntokens)?;

        Ok(Request {
            raw: line,
            command_range,
            key_range,
            command,
            value_meta,
            value: None,
        })
    }

    pub fn command(&self) -> Command { self.command }

    pub fn raw(&self) -> &[u8] { &self.raw }

    pub fn command_token(&self) -> &[u8] { &self.raw[self.command_range.clone()] }

    pub fn key(&self) -> &[u8] {
        match &self.key_range {
            Some(r) => &self.raw[r.clone()],
            None => &[],
        }
    }

    pub fn value_meta(&self) -> Option<ValueMeta> { self.value_meta }

    /// Bytes the caller must still read (§4.1 "vlen semantics"): a second
    /// read of exactly this many bytes, ending in CRLF, before the request
    /// is handed to the routing runtime.
    pub fn pending_value_len(&self) -> usize {
        self.value_meta.map(|m| m.vlen as usize).unwrap_or(0)
    }

    /// Attaches the value payload read separately by the client adapter.
    /// `value` must be exactly `pending_value_len()` bytes, ending in CRLF.
    pub fn attach_value(&mut self, value: Bytes) -> Result<(), ProtocolError> {
        let expected = self.pending_value_len();
        if value.len() != expected {
            return Err(ProtocolError::Malformed("value length mismatch"));
        }
        if expected >= 2 && &value[expected - 2..] != b"\r\n" {
            return Err(ProtocolError::BadValueTrailer);
        }
        self.value = Some(value);
        Ok(())
    }

    pub fn value(&self) -> Option<&[u8]> { self.value.as_deref() }
}

fn classify(
    cmd: &[u8], line: &Bytes, cur: usize, ntokens: usize,
) -> Result<(Command, Option<ValueMeta>), ProtocolError> {
    match cmd.len() {
        2 if cmd[0] == b'm' => {
            let command = match cmd[1] {
                b'g' => Command::Mg,
                b's' => Command::Ms,
                b'd' => Command::Md,
                b'n' => Command::Mn,
                b'a' => Command::Ma,
                b'e' => Command::Me,
                _ => return Err(ProtocolError::UnknownCommand),
            };
            Ok((command, None))
        },
        3 if cmd == b"get" => Ok((Command::Get, None)),
        3 if cmd == b"set" => {
            if ntokens != 2 {
                return Err(ProtocolError::Malformed("set requires a key"));
            }
            let rest = &line[cur..line.len() - 2];
            let meta = parse_set_fields(rest)?;
            Ok((Command::Set, Some(meta)))
        },
        6 if cmd == b"delete" => Ok((Command::Delete, None)),
        _ => Err(ProtocolError::UnknownCommand),
    }
}

/// Parses `<flags> <exptime> <bytes>` following `set <key> `, exactly as
/// `process_request()` does with `strtoul`/`strtol`: space-delimited decimal
/// fields, range-checked, `vlen` adjusted by `+2` for the trailing CRLF.
/// `rest` starts immediately after the delimiter following the key token.
fn parse_set_fields(rest: &[u8]) -> Result<ValueMeta, ProtocolError> {
    let mut parts = rest.splitn(3, |&b| b == b' ');
    let flags_bytes = parts.next().ok_or(ProtocolError::Malformed("missing flags"))?;
    let exptime_bytes = parts.next().ok_or(ProtocolError::Malformed("missing exptime"))?;
    let vlen_bytes = parts.next().ok_or(ProtocolError::Malformed("missing bytes"))?;

    let flags: u32 = btoi::btoi(flags_bytes).map_err(|_| ProtocolError::InvalidNumber("flags"))?;
    let exptime: i32 = btoi::btoi(exptime_bytes).map_err(|_| ProtocolError::InvalidNumber("exptime"))?;

    // vlen_bytes may have trailing " noreply" or similar; only the decimal
    // prefix up to the next space needs to parse. Split off the rest.
    let vlen_digits = match vlen_bytes.iter().position(|&b| b == b' ') {
        Some(idx) => &vlen_bytes[..idx],
        None => vlen_bytes,
    };
    let vlen: i64 = btoi::btoi(vlen_digits).map_err(|_| ProtocolError::InvalidNumber("bytes"))?;

    if vlen < 0 || vlen > MAX_VLEN {
        return Err(ProtocolError::ValueTooLarge);
    }

    Ok(ValueMeta {
        flags,
        exptime,
        vlen: vlen as i32 + 2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(s: &str) -> Request { Request::parse(Bytes::copy_from_slice(s.as_bytes())).unwrap() }

    #[test]
    fn parses_get() {
        let r = req("get foo\r\n");
        assert_eq!(r.command(), Command::Get);
        assert_eq!(r.key(), b"foo");
        assert!(r.value_meta().is_none());
    }

    #[test]
    fn parses_meta_commands() {
        assert_eq!(req("mg foo\r\n").command(), Command::Mg);
        assert_eq!(req("ms foo\r\n").command(), Command::Ms);
        assert_eq!(req("md foo\r\n").command(), Command::Md);
        assert_eq!(req("mn\r\n").command(), Command::Mn);
        assert_eq!(req("ma foo\r\n").command(), Command::Ma);
        assert_eq!(req("me foo\r\n").command(), Command::Me);
    }

    #[test]
    fn parses_delete() {
        let r = req("delete foo\r\n");
        assert_eq!(r.command(), Command::Delete);
        assert_eq!(r.key(), b"foo");
    }

    #[test]
    fn parses_set_with_vlen_adjustment() {
        let r = req("set k 0 0 5\r\n");
        let meta = r.value_meta().unwrap();
        assert_eq!(meta.flags, 0);
        assert_eq!(meta.exptime, 0);
        assert_eq!(meta.vlen, 7); // 5 + 2 for CRLF
        assert_eq!(r.pending_value_len(), 7);
    }

    #[test]
    fn set_zero_length_value_is_accepted() {
        let r = req("set k 0 0 0\r\n");
        assert_eq!(r.value_meta().unwrap().vlen, 2);
    }

    #[test]
    fn set_max_vlen_is_accepted_and_one_more_is_rejected() {
        let ok = format!("set k 0 0 {}\r\n", MAX_VLEN);
        assert!(Request::parse(Bytes::from(ok.into_bytes())).is_ok());

        let too_big = format!("set k 0 0 {}\r\n", MAX_VLEN + 1);
        assert_eq!(
            Request::parse(Bytes::from(too_big.into_bytes())),
            Err(ProtocolError::ValueTooLarge)
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(req_err("bogus foo\r\n"), ProtocolError::UnknownCommand);
    }

    #[test]
    fn rejects_malformed_set() {
        assert_eq!(req_err("set k notanumber 0 5\r\n"), ProtocolError::InvalidNumber("flags"));
    }

    fn req_err(s: &str) -> ProtocolError {
        Request::parse(Bytes::copy_from_slice(s.as_bytes())).unwrap_err()
    }

    #[test]
    fn attaches_and_validates_value() {
        let mut r = req("set k 0 0 3\r\n");
        assert!(r.attach_value(Bytes::from_static(b"abc\r\n")).is_ok());
        assert_eq!(r.value(), Some(&b"abc\r\n"[..]));
    }

    #[test]
    fn rejects_value_without_crlf_trailer() {
        let mut r = req("set k 0 0 3\r\n");
        assert_eq!(r.attach_value(Bytes::from_static(b"abcXX")), Err(ProtocolError::BadValueTrailer));
    }
}
