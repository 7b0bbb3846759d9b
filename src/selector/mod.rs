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
//! Pool selection: mapping a key to one of a pool's backends (§4.4).
//!
//! The routing script never picks a backend index itself; it hands the
//! routing runtime a pool handle and a key, and the runtime resolves that to
//! a backend via a 32-bit hash of the key reduced modulo the pool size.
pub mod hash;

use self::hash::murmur3_32;

/// A fixed, ordered set of backend identities a key can be routed across.
///
/// `HashSelector` is this proxy's only strategy: every pool named from
/// routing scripts resolves a key to `murmur3_32(key) % backends.len()`.
/// Pools with zero backends are a configuration error caught at worker
/// startup, not a runtime one -- `select` would panic on an empty pool.
#[derive(Debug, Clone)]
pub struct HashSelector {
    backend_count: usize,
}

impl HashSelector {
    pub fn new(backend_count: usize) -> HashSelector {
        assert!(backend_count > 0, "pool must have at least one backend");
        HashSelector { backend_count }
    }

    /// Returns the index, within `[0, backend_count)`, of the backend that
    /// owns `key`.
    pub fn select(&self, key: &[u8]) -> usize {
        (murmur3_32(key) as usize) % self.backend_count
    }

    pub fn backend_count(&self) -> usize { self.backend_count }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_in_range() {
        let sel = HashSelector::new(4);
        for i in 0..100 {
            let key = format!("key-{}", i);
            let idx = sel.select(key.as_bytes());
            assert!(idx < 4);
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let sel = HashSelector::new(8);
        assert_eq!(sel.select(b"stable-key"), sel.select(b"stable-key"));
    }

    #[test]
    fn single_backend_pool_always_selects_zero() {
        let sel = HashSelector::new(1);
        assert_eq!(sel.select(b"anything"), 0);
    }

    #[test]
    #[should_panic]
    fn empty_pool_is_rejected() {
        HashSelector::new(0);
    }
}
