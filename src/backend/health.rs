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
//! Fixed-cooloff backend health tracking (§4.3, §9 "Backend retry policy").
//!
//! This proxy resolves the Open Question on backend retry policy in favor of
//! a fixed cooloff-then-retry scheme rather than true exponential backoff:
//! once `error_limit` consecutive errors accrue, the backend is marked
//! unhealthy for `cooloff_period_ms` and then given a single fresh attempt.
use std::time::{Duration, Instant};
use tracing::debug;

pub struct BackendHealth {
    cooloff_enabled: bool,
    cooloff_period_ms: u64,
    error_limit: usize,
    error_count: usize,
    in_cooloff: bool,
    epoch: u64,
    cooloff_done_at: Instant,
}

impl BackendHealth {
    pub fn new(cooloff_enabled: bool, cooloff_period_ms: u64, error_limit: usize) -> BackendHealth {
        debug!(
            cooloff_enabled,
            cooloff_period_ms, error_limit, "configuring backend health tracking"
        );

        BackendHealth {
            cooloff_enabled,
            cooloff_period_ms,
            error_limit,
            error_count: 0,
            in_cooloff: false,
            epoch: 0,
            cooloff_done_at: Instant::now(),
        }
    }

    /// Reports whether the backend may be used right now, flipping out of
    /// cooloff and bumping the epoch if the cooloff period has elapsed.
    pub fn is_healthy(&mut self) -> bool {
        if !self.cooloff_enabled || !self.in_cooloff {
            return true;
        }

        if self.cooloff_done_at < Instant::now() {
            self.error_count = 0;
            self.in_cooloff = false;
            self.epoch += 1;

            return true;
        }

        false
    }

    /// Bumped every time the backend transitions cooloff state, so callers
    /// holding a stale `PendingIO` can tell whether their backend has been
    /// recycled out from under them.
    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn increment_error(&mut self) {
        if !self.cooloff_enabled {
            return;
        }

        self.error_count += 1;

        if self.error_count >= self.error_limit && !self.in_cooloff {
            debug!("error count over limit, entering cooloff");
            self.in_cooloff = true;
            self.epoch += 1;
            self.cooloff_done_at = Instant::now() + Duration::from_millis(self.cooloff_period_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_error_limit_reached() {
        let mut health = BackendHealth::new(true, 50, 3);
        assert!(health.is_healthy());
        health.increment_error();
        assert!(health.is_healthy());
        health.increment_error();
        assert!(health.is_healthy());
        health.increment_error();
        assert!(!health.is_healthy());
    }

    #[test]
    fn disabled_cooloff_is_always_healthy() {
        let mut health = BackendHealth::new(false, 50, 1);
        health.increment_error();
        health.increment_error();
        assert!(health.is_healthy());
        assert_eq!(health.epoch(), 0);
    }

    #[test]
    fn epoch_bumps_on_entering_cooloff() {
        let mut health = BackendHealth::new(true, 50, 1);
        assert_eq!(health.epoch(), 0);
        health.increment_error();
        assert_eq!(health.epoch(), 1);
    }
}
