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
use mcproxy::config::WorkerConfiguration;
use mcproxy::worker::Worker;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::process;

fn main() {
    mcproxy::logging::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("mcproxy.toml"));

    let config = match WorkerConfiguration::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {}", config_path.display(), e);
            process::exit(1);
        },
    };

    let worker_count = config.workers.max(1);
    tracing::info!(workers = worker_count, listen = %config.listen, "starting");

    let handles: Vec<_> = (0..worker_count).map(|id| Worker::new(id, config.clone()).spawn()).collect();

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("failed to install signal handler");
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "received shutdown signal");
            process::exit(0);
        }
    });

    for handle in handles {
        let _ = handle.join();
    }
}
