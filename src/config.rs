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
//! Worker configuration: listen address, routing script, and the backend
//! pool, loaded with the `config` crate instead of a hand-rolled parser
//! (config-file parsing is out of scope per spec.md's Non-goals, though the
//! file format it reads still needs a real loader).
use crate::errors::CreationError;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfiguration {
    pub address: SocketAddr,
    /// Relative weight, as passed back to the routing script's
    /// `mcp.server(ip, port, weight)` call (§6) -- recorded here so an
    /// operator can see and change it alongside the rest of a backend's
    /// settings, even though the current selector doesn't consume it
    /// (see DESIGN.md).
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_weight() -> i64 { 1 }

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfiguration {
    /// Address this worker's listener binds and `SO_REUSEPORT`s onto.
    pub listen: SocketAddr,
    /// Routing script every worker loads once at startup (§4.2, §6
    /// "Config entry point").
    pub script: PathBuf,
    pub backends: HashMap<String, BackendConfiguration>,
    #[serde(default = "default_worker_count")]
    pub workers: usize,
}

fn default_worker_count() -> usize { std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) }

impl WorkerConfiguration {
    /// Loads configuration from `path` (JSON, TOML, or YAML, detected by
    /// extension), overlaying any `MCPROXY__*` environment variables on top
    /// -- `MCPROXY__LISTEN=0.0.0.0:11311` overrides the `listen` key, and so
    /// on, the same double-underscore nesting convention the `config` crate
    /// documents for its `Environment` source.
    pub fn load(path: &Path) -> Result<WorkerConfiguration, CreationError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix("MCPROXY").separator("__"))
            .build()
            .map_err(|e| CreationError::InvalidResource(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| CreationError::InvalidResource(format!("invalid configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_at_least_one() {
        assert!(default_worker_count() >= 1);
    }
}
