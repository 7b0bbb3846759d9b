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
//! The in-flight request arena (Design Notes §9).
//!
//! A `PendingIO` tracks one request written to a backend and awaiting its
//! response. Rather than giving the routing coroutine a pointer back into a
//! connection (an ownership headache once the connection can be recycled
//! out from under a suspended script), every in-flight request lives in a
//! `slab::Slab` keyed by an integer handle -- the same arena shape the
//! source's `MessageQueue` uses for its `slot_order`/`slots` pair, just
//! specialized to one request per slot instead of fragmentable batches.
use crate::errors::BackendError;
use crate::protocol::Response;
use bytes::Bytes;
use slab::Slab;
use tokio::sync::oneshot;

/// One request written to a backend, plus the channel used to deliver its
/// eventual response (or failure) back to whoever submitted it -- normally
/// the routing runtime's completion path (§4.2, §6).
pub struct PendingIO {
    pub request: Bytes,
    pub reply_to: oneshot::Sender<Result<Response, BackendError>>,
}

/// A handle into a `PendingIoArena`. Opaque outside this module; stable for
/// the lifetime of the entry, never reused while live.
pub type Handle = usize;

/// Arena of in-flight requests for a single backend connection.
///
/// Entries are completed strictly in submission order (the memcached text
/// protocol is not out-of-order capable per connection), so the arena also
/// tracks handles in a FIFO alongside the slab so the reader state machine
/// always knows which entry the next response on the wire belongs to.
#[derive(Default)]
pub struct PendingIoArena {
    slots: Slab<PendingIO>,
    order: std::collections::VecDeque<Handle>,
}

impl PendingIoArena {
    pub fn new() -> PendingIoArena {
        PendingIoArena {
            slots: Slab::new(),
            order: std::collections::VecDeque::new(),
        }
    }

    pub fn submit(&mut self, io: PendingIO) -> Handle {
        let handle = self.slots.insert(io);
        self.order.push_back(handle);
        handle
    }

    pub fn len(&self) -> usize { self.order.len() }

    pub fn is_empty(&self) -> bool { self.order.is_empty() }

    /// The handle whose response is expected next on the wire.
    pub fn front(&self) -> Option<Handle> { self.order.front().copied() }

    /// Removes and returns the oldest in-flight entry, for completion or for
    /// failing out on a connection error.
    pub fn pop_front(&mut self) -> Option<PendingIO> {
        let handle = self.order.pop_front()?;
        self.slots.try_remove(handle)
    }

    /// Drains every in-flight entry, in FIFO order, for connection teardown.
    pub fn drain(&mut self) -> Vec<PendingIO> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(io) = self.pop_front() {
            out.push(io);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_io() -> (PendingIO, oneshot::Receiver<Result<Response, BackendError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingIO {
                request: Bytes::from_static(b"get foo\r\n"),
                reply_to: tx,
            },
            rx,
        )
    }

    #[test]
    fn fifo_ordering() {
        let mut arena = PendingIoArena::new();
        let (io1, _rx1) = dummy_io();
        let (io2, _rx2) = dummy_io();
        let h1 = arena.submit(io1);
        let h2 = arena.submit(io2);
        assert_eq!(arena.front(), Some(h1));
        let popped = arena.pop_front().unwrap();
        assert_eq!(&popped.request[..], b"get foo\r\n");
        assert_eq!(arena.front(), Some(h2));
    }

    #[test]
    fn drain_empties_arena() {
        let mut arena = PendingIoArena::new();
        let (io1, _rx1) = dummy_io();
        let (io2, _rx2) = dummy_io();
        arena.submit(io1);
        arena.submit(io2);
        assert_eq!(arena.drain().len(), 2);
        assert!(arena.is_empty());
    }
}
