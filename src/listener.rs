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
//! The accept loop: binds the listening socket and spawns one local task per
//! accepted client, each driven by `client::ClientConnection`.
use crate::backend::Backend;
use crate::client::ClientConnection;
use crate::errors::CreationError;
use crate::routing::lua::LuaRuntime;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Binds and configures the listening socket: `SO_REUSEADDR` always,
/// `SO_REUSEPORT` on unix, so a rolling restart can rebind before the old
/// worker has finished draining.
pub fn bind(addr: SocketAddr) -> Result<TcpListener, CreationError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(CreationError::Io)
}

/// Accepts connections until the listener itself errors out (the socket was
/// closed out from under us), handing each one to a freshly built
/// `ClientConnection` spawned as a local task on this worker's `LocalSet`.
pub async fn run(listener: TcpListener, lua: Rc<LuaRuntime>, backends: Rc<HashMap<String, Backend>>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            },
        };
        debug!(%peer, "client connected");

        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let conn = ClientConnection::new(socket, lua.clone(), backends.clone());
        tokio::task::spawn_local(async move {
            conn.run().await;
            debug!(%peer, "client disconnected");
        });
    }
}

/// Logs that a listener is coming up.
pub fn announce(address: &SocketAddr) { info!(%address, "listener starting"); }
