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
//! Per-client list of suspended routing coroutines awaiting a backend
//! response (§4.5).
//!
//! Each client connection owns one `IoQueue`. A coroutine that yields a
//! backend call is stashed here under an integer handle rather than being
//! referenced back from the `Backend`'s in-flight arena -- the handle is
//! the only thing that crosses the submit/complete boundary, so neither
//! side needs a pointer into the other (Design Notes §9, "Cyclic
//! references").
use slab::Slab;

/// Opaque handle into an `IoQueue`. Stable for the entry's lifetime.
pub type IoHandle = usize;

struct Entry {
    coroutine: mlua::RegistryKey,
}

#[derive(Default)]
pub struct IoQueue {
    entries: Slab<Entry>,
}

impl IoQueue {
    pub fn new() -> IoQueue { IoQueue { entries: Slab::new() } }

    /// Registers a suspended coroutine, returning the handle the caller
    /// threads through the backend submission it's waiting on.
    pub fn submit(&mut self, coroutine: mlua::RegistryKey) -> IoHandle {
        self.entries.insert(Entry { coroutine })
    }

    /// Removes and returns the coroutine for `handle` once its backend
    /// response has arrived, so it can be resumed.
    pub fn complete(&mut self, handle: IoHandle) -> Option<mlua::RegistryKey> {
        self.entries.try_remove(handle).map(|e| e.coroutine)
    }

    /// Drops a suspended coroutine without resuming it -- called when the
    /// owning client connection is torn down while requests are still in
    /// flight (§4.2 "Cancellation"). Never performs I/O.
    pub fn finalize(&mut self, handle: IoHandle) {
        self.entries.try_remove(handle);
    }

    /// Releases every still-suspended coroutine at once -- called when the
    /// owning client connection is torn down with requests in flight
    /// (§4.2 "Cancellation", §5 "Cancellation").
    pub fn finalize_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn len(&self) -> usize { self.entries.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_then_complete_round_trips_handle() {
        let lua = mlua::Lua::new();
        let key = lua.create_registry_value("placeholder").unwrap();
        let mut q = IoQueue::new();
        let handle = q.submit(key);
        assert_eq!(q.len(), 1);
        assert!(q.complete(handle).is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn finalize_drops_without_resuming() {
        let lua = mlua::Lua::new();
        let key = lua.create_registry_value("placeholder").unwrap();
        let mut q = IoQueue::new();
        let handle = q.submit(key);
        q.finalize(handle);
        assert!(q.is_empty());
        assert!(q.complete(handle).is_none());
    }

    #[test]
    fn finalize_all_clears_every_outstanding_entry() {
        let lua = mlua::Lua::new();
        let mut q = IoQueue::new();
        for _ in 0..3 {
            let key = lua.create_registry_value("placeholder").unwrap();
            q.submit(key);
        }
        assert_eq!(q.len(), 3);
        q.finalize_all();
        assert!(q.is_empty());
    }
}
