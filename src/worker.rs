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
//! Per-worker bootstrap (§5 "Scheduling model"): one OS thread, one
//! single-threaded runtime, one routing runtime, one backend registry. No
//! state crosses this boundary into another worker.
use crate::backend::Backend;
use crate::config::WorkerConfiguration;
use crate::listener;
use crate::routing::lua::LuaRuntime;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tracing::error;

pub struct Worker {
    id: usize,
    config: WorkerConfiguration,
}

impl Worker {
    pub fn new(id: usize, config: WorkerConfiguration) -> Worker { Worker { id, config } }

    /// Spawns this worker on its own OS thread and returns immediately.
    pub fn spawn(self) -> std::thread::JoinHandle<()> {
        let id = self.id;
        std::thread::Builder::new()
            .name(format!("mcproxy-worker-{}", id))
            .spawn(move || self.run())
            .expect("failed to spawn worker thread")
    }

    fn run(self) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build worker runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.serve());
    }

    async fn serve(self) {
        // Backends come up first, keyed by address, so that `mcp.server(ip,
        // port, weight)` in the script below has something to look up --
        // this worker's configuration is what actually opens the
        // connections, not the script (see DESIGN.md).
        let mut backends = HashMap::new();
        for backend_config in self.config.backends.values() {
            let address = backend_config.address;
            match Backend::new(address, backend_config.options.clone()) {
                Ok(backend) => {
                    backends.insert(address.to_string(), backend);
                },
                Err(e) => {
                    error!(worker = self.id, backend = %address, error = %e, "failed to configure backend");
                    return;
                },
            }
        }
        let backends = Rc::new(backends);

        let lua = Rc::new(LuaRuntime::new(backends.clone()));
        if let Err(e) = lua.load_config(&self.config.script) {
            error!(worker = self.id, error = %e, "failed to load routing script");
            return;
        }

        tokio::task::spawn_local(reap_backend_health(backends.clone()));

        let listener = match listener::bind(self.config.listen) {
            Ok(l) => l,
            Err(e) => {
                error!(worker = self.id, error = %e, "failed to bind listener");
                return;
            },
        };
        listener::announce(&self.config.listen);
        listener::run(listener, lua, backends).await;
    }
}

/// Periodically drains each backend's connection-failure channel so
/// `Backend::is_healthy` stays current even when no request happens to
/// observe a failing connection directly.
async fn reap_backend_health(backends: Rc<HashMap<String, Backend>>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        ticker.tick().await;
        for backend in backends.values() {
            backend.reap_commands();
        }
    }
}
