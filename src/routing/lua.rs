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
//! `mlua`-backed routing runtime: worker script bootstrap, `mcp.*` bindings,
//! and the coroutine resume loop (§4.2, §6).
use crate::backend::Backend;
use crate::errors::RoutingError;
use crate::protocol::Request;
use crate::routing::Hook;
use bytes::Bytes;
use mlua::{Lua, MultiValue, RegistryKey, Table, ThreadStatus, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// A handle to one of the worker's preconfigured backends, as returned by
/// `mcp.server(ip, port, weight)` (§6). `name` is the backend's address in
/// `ip:port` form -- the key the worker's backend registry (built from its
/// configuration before the script loads) is indexed by.
#[derive(Debug, Clone)]
pub struct McpServer {
    pub name: String,
    pub weight: i64,
}

impl mlua::UserData for McpServer {
    fn add_fields<'lua, F: mlua::UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.name.clone()));
        fields.add_field_method_get("weight", |_, this| Ok(this.weight));
    }
}

/// `mcp.hash_selector(hashfunc, pool)` -- a callable userdata that maps a
/// request to one of `pool`'s servers via `murmur3_32(key) % pool.len()`
/// (§4.4). This proxy only ships one hash function, so `hashfunc` is
/// accepted but ignored -- noted as a simplification in DESIGN.md. Called
/// from a script as `selector(request)` (§6), so `request` arrives as an
/// `McpRequest` userdata, not a bare key string.
#[derive(Debug, Clone)]
pub struct McpHashSelector {
    pub selector: crate::selector::HashSelector,
    pub pool: Vec<String>,
}

impl mlua::UserData for McpHashSelector {
    fn add_meta_methods<'lua, M: mlua::UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(mlua::MetaMethod::Call, |_, this, request: mlua::AnyUserData| {
            let key = request.borrow::<McpRequest>()?.key.clone();
            let idx = this.selector.select(&key);
            Ok(McpServer { name: this.pool[idx].clone(), weight: 1 })
        });
    }
}

/// The `request` argument a routing function is called with (§6
/// `request:key()`, `request:command()`). Holds its own copy of the raw
/// command line so it can be forwarded verbatim if the function yields it
/// straight back out to a backend.
#[derive(Debug, Clone)]
pub struct McpRequest {
    raw: Bytes,
    key: Bytes,
    command_code: i64,
}

impl McpRequest {
    fn from_request(request: &Request) -> McpRequest {
        McpRequest {
            raw: Bytes::copy_from_slice(request.raw()),
            key: Bytes::copy_from_slice(request.key()),
            command_code: hook_code(Hook::from(request.command())),
        }
    }
}

impl mlua::UserData for McpRequest {
    fn add_methods<'lua, M: mlua::UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("key", |lua, this, ()| lua.create_string(&this.key[..]));
        methods.add_method("command", |_, this, ()| Ok(this.command_code));
    }
}

/// The `response` argument a resumed routing coroutine is called with (§6
/// `response:ok()`).
#[derive(Debug, Clone)]
pub struct McpResponse {
    raw: Bytes,
}

impl McpResponse {
    fn from_bytes(raw: &[u8]) -> McpResponse { McpResponse { raw: Bytes::copy_from_slice(raw) } }

    /// False for the error-shaped replies a backend or this proxy's own
    /// error paths can produce (§7); true for everything else.
    fn is_ok(&self) -> bool {
        !(self.raw.starts_with(b"ERROR") || self.raw.starts_with(b"CLIENT_ERROR") || self.raw.starts_with(b"SERVER_ERROR"))
    }
}

impl mlua::UserData for McpResponse {
    fn add_methods<'lua, M: mlua::UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("ok", |_, this, ()| Ok(this.is_ok()));
    }
}

/// The outcome of starting or resuming a routing coroutine (§4.2). `client.rs`
/// registers a `Yielded` variant's coroutine in the connection's `IoQueue`
/// before submitting the request to the named backend.
pub enum Resumption {
    Ready(Vec<u8>),
    Yielded { backend: String, request: Bytes, coroutine: RegistryKey },
    Errored(RoutingError),
}

/// Per-worker routing runtime: one `Lua` instance, one hook table, loaded
/// once from the worker's configured script (§5 "Global mutable state").
pub struct LuaRuntime {
    lua: Lua,
    hooks: Rc<RefCell<HashMap<Hook, RegistryKey>>>,
}

impl LuaRuntime {
    /// `backends` is the worker's preconfigured backend registry, keyed by
    /// `ip:port` address string -- the worker builds every `Backend`'s
    /// connection pool from its own configuration before the script ever
    /// runs, and `mcp.server` below just looks one up (§4.2 "declare a
    /// Backend"; see DESIGN.md for why construction happens eagerly here
    /// rather than lazily from the script).
    pub fn new(backends: Rc<HashMap<String, Backend>>) -> LuaRuntime {
        let lua = Lua::new();
        let hooks = Rc::new(RefCell::new(HashMap::new()));
        let runtime = LuaRuntime { lua, hooks };
        runtime.install_mcp_table(backends);
        runtime
    }

    fn install_mcp_table(&self, backends: Rc<HashMap<String, Backend>>) {
        let mcp: Table = self.lua.create_table().expect("create mcp table");

        for (name, hook) in [
            ("CMD_ANY", Hook::Any),
            ("CMD_MG", Hook::Mg),
            ("CMD_MS", Hook::Ms),
            ("CMD_MD", Hook::Md),
            ("CMD_MN", Hook::Mn),
            ("CMD_MA", Hook::Ma),
            ("CMD_ME", Hook::Me),
            ("CMD_GET", Hook::Get),
            ("CMD_SET", Hook::Set),
            ("CMD_DELETE", Hook::Delete),
        ] {
            mcp.set(name, hook_code(hook)).expect("set hook constant");
        }

        let hooks = self.hooks.clone();
        let attach = self
            .lua
            .create_function(move |lua, (code, func): (i64, mlua::Function)| {
                let hook = hook_from_code(code).ok_or_else(|| mlua::Error::RuntimeError("unknown hook".into()))?;
                let key = lua.create_registry_value(func)?;
                hooks.borrow_mut().insert(hook, key);
                Ok(())
            })
            .expect("create mcp.attach");
        mcp.set("attach", attach).expect("set mcp.attach");

        let server = self
            .lua
            .create_function(move |_, (ip, port, weight): (String, u16, i64)| {
                let addr: SocketAddr = format!("{}:{}", ip, port)
                    .parse()
                    .map_err(|_| mlua::Error::RuntimeError(format!("invalid backend address {}:{}", ip, port)))?;
                let name = addr.to_string();
                if !backends.contains_key(&name) {
                    return Err(mlua::Error::RuntimeError(format!(
                        "backend {} is not declared in this worker's configuration",
                        name
                    )));
                }
                Ok(McpServer { name, weight })
            })
            .expect("create mcp.server");
        mcp.set("server", server).expect("set mcp.server");

        let hash_selector = self
            .lua
            .create_function(|_, (_hashfunc, pool): (Value, Table)| {
                let mut names = Vec::new();
                for entry in pool.sequence_values::<mlua::AnyUserData>() {
                    let srv = entry?;
                    let srv = srv.borrow::<McpServer>()?;
                    names.push(srv.name.clone());
                }
                let selector = crate::selector::HashSelector::new(names.len().max(1));
                Ok(McpHashSelector { selector, pool: names })
            })
            .expect("create mcp.hash_selector");
        mcp.set("hash_selector", hash_selector).expect("set mcp.hash_selector");

        self.lua.globals().set("mcp", mcp).expect("install mcp table");
    }

    /// Loads the worker script and runs its `mcp_config_selectors()` /
    /// `mcp_config_routes(selectors)` entry points, in that order, exactly
    /// as a worker's own bootstrap sequence does (§4.2, §5).
    pub fn load_config(&self, path: &Path) -> Result<(), RoutingError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| RoutingError::Lua(mlua::Error::RuntimeError(format!("reading {}: {}", path.display(), e))))?;
        self.lua.load(&source).exec()?;

        let config_selectors: mlua::Function = self.lua.globals().get("mcp_config_selectors")?;
        let selectors: Value = config_selectors.call(Value::Nil)?;

        let config_routes: mlua::Function = self.lua.globals().get("mcp_config_routes")?;
        config_routes.call::<_, ()>(selectors)?;

        debug!(hooks = self.hooks.borrow().len(), "routing runtime configured");
        Ok(())
    }

    /// Starts a fresh coroutine for `request`, running it until it
    /// produces a reply, yields a backend call, or errors (§4.2
    /// "Invocation protocol").
    pub fn start(&self, request: &Request) -> Resumption {
        let hook = Hook::from(request.command());
        let func = {
            let hooks = self.hooks.borrow();
            hooks
                .get(&hook)
                .or_else(|| hooks.get(&Hook::Any))
                .and_then(|key| self.lua.registry_value::<mlua::Function>(key).ok())
        };

        let func = match func {
            Some(f) => f,
            None => return Resumption::Errored(RoutingError::NoRouteAttached),
        };

        let thread = match self.lua.create_thread(func) {
            Ok(t) => t,
            Err(e) => return Resumption::Errored(RoutingError::Lua(e)),
        };

        let arg = match self.lua.create_userdata(McpRequest::from_request(request)) {
            Ok(ud) => ud,
            Err(e) => return Resumption::Errored(RoutingError::Lua(e)),
        };
        self.resume_thread(thread, MultiValue::from_vec(vec![Value::UserData(arg)]))
    }

    /// Resumes a previously yielded coroutine with the backend's response
    /// bytes, continuing until the next `Ready`/`Yielded`/`Errored` outcome
    /// (§4.2 "Resumption").
    pub fn resume(&self, key: RegistryKey, response: &[u8]) -> Resumption {
        let thread: mlua::Thread = match self.lua.registry_value(&key) {
            Ok(t) => t,
            Err(e) => return Resumption::Errored(RoutingError::Lua(e)),
        };
        let _ = self.lua.remove_registry_value(key);

        let arg = match self.lua.create_userdata(McpResponse::from_bytes(response)) {
            Ok(ud) => ud,
            Err(e) => return Resumption::Errored(RoutingError::Lua(e)),
        };
        self.resume_thread(thread, MultiValue::from_vec(vec![Value::UserData(arg)]))
    }

    fn resume_thread(&self, thread: mlua::Thread, args: MultiValue) -> Resumption {
        let result = thread.resume::<_, MultiValue>(args);
        match result {
            Err(e) => Resumption::Errored(RoutingError::Lua(e)),
            Ok(values) => {
                if thread.status() == ThreadStatus::Resumable {
                    // Yielded (backend, request): the request half may be the
                    // same McpRequest the function was called with (forwarded
                    // unmodified) or a raw wire string it built itself.
                    let mut iter = values.into_iter();
                    let backend = iter.next();
                    let request = iter.next();
                    let request_bytes = match &request {
                        Some(Value::String(s)) => Some(Bytes::copy_from_slice(s.as_bytes())),
                        Some(Value::UserData(ud)) => ud.borrow::<McpRequest>().ok().map(|r| r.raw.clone()),
                        _ => None,
                    };
                    match (backend, request_bytes) {
                        (Some(Value::UserData(ud)), Some(request)) => match ud.borrow::<McpServer>() {
                            Ok(srv) => {
                                let coroutine = self
                                    .lua
                                    .create_registry_value(thread)
                                    .expect("register suspended coroutine");
                                Resumption::Yielded { backend: srv.name.clone(), request, coroutine }
                            },
                            Err(e) => Resumption::Errored(RoutingError::Lua(e)),
                        },
                        _ => Resumption::Errored(RoutingError::Lua(mlua::Error::RuntimeError(
                            "routing coroutine yielded an unexpected shape".into(),
                        ))),
                    }
                } else {
                    // Finished: a reply string, a response/request userdata
                    // returned as-is, or nothing (error already surfaced above).
                    let reply = values
                        .into_iter()
                        .next()
                        .and_then(|v| match v {
                            Value::String(s) => Some(s.as_bytes().to_vec()),
                            Value::UserData(ud) => ud
                                .borrow::<McpResponse>()
                                .map(|r| r.raw.to_vec())
                                .or_else(|_| ud.borrow::<McpRequest>().map(|r| r.raw.to_vec()))
                                .ok(),
                            _ => None,
                        })
                        .unwrap_or_else(|| crate::protocol::ERROR_REPLY.to_vec());
                    Resumption::Ready(reply)
                }
            },
        }
    }
}

fn hook_code(hook: Hook) -> i64 {
    match hook {
        Hook::Any => 0,
        Hook::Mg => 1,
        Hook::Ms => 2,
        Hook::Md => 3,
        Hook::Mn => 4,
        Hook::Ma => 5,
        Hook::Me => 6,
        Hook::Get => 7,
        Hook::Set => 8,
        Hook::Delete => 9,
    }
}

fn hook_from_code(code: i64) -> Option<Hook> {
    Some(match code {
        0 => Hook::Any,
        1 => Hook::Mg,
        2 => Hook::Ms,
        3 => Hook::Md,
        4 => Hook::Mn,
        5 => Hook::Ma,
        6 => Hook::Me,
        7 => Hook::Get,
        8 => Hook::Set,
        9 => Hook::Delete,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_codes_round_trip_for_attach_targets() {
        for hook in [
            Hook::Any,
            Hook::Mg,
            Hook::Ms,
            Hook::Md,
            Hook::Mn,
            Hook::Ma,
            Hook::Me,
            Hook::Get,
            Hook::Set,
            Hook::Delete,
        ] {
            let code = hook_code(hook);
            assert_eq!(hook_from_code(code), Some(hook));
        }
    }

    fn empty_backends() -> Rc<HashMap<String, Backend>> { Rc::new(HashMap::new()) }

    #[test]
    fn missing_hook_errors_as_no_route() {
        let runtime = LuaRuntime::new(empty_backends());
        let request = Request::parse(Bytes::from_static(b"get foo\r\n")).unwrap();
        match runtime.start(&request) {
            Resumption::Errored(RoutingError::NoRouteAttached) => {},
            _ => panic!("expected NoRouteAttached"),
        }
    }

    #[test]
    fn attached_function_returning_a_string_is_ready_immediately() {
        let runtime = LuaRuntime::new(empty_backends());
        runtime
            .lua
            .load("mcp.attach(mcp.CMD_GET, function(r) return \"SERVER_ERROR no route\\r\\n\" end)")
            .exec()
            .unwrap();
        let request = Request::parse(Bytes::from_static(b"get foo\r\n")).unwrap();
        match runtime.start(&request) {
            Resumption::Ready(reply) => assert_eq!(&reply[..], b"SERVER_ERROR no route\r\n"),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn mcp_server_rejects_an_address_absent_from_the_worker_configuration() {
        let runtime = LuaRuntime::new(empty_backends());
        let err = runtime.lua.load("return mcp.server('127.0.0.1', 11211, 1)").exec().unwrap_err();
        assert!(err.to_string().contains("not declared"));
    }

    #[test]
    fn request_userdata_exposes_key_and_command() {
        let runtime = LuaRuntime::new(empty_backends());
        runtime
            .lua
            .load("mcp.attach(mcp.CMD_GET, function(r) return r:key() .. ':' .. tostring(r:command()) end)")
            .exec()
            .unwrap();
        let request = Request::parse(Bytes::from_static(b"get foo\r\n")).unwrap();
        match runtime.start(&request) {
            Resumption::Ready(reply) => assert_eq!(&reply[..], b"foo:7"),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn response_ok_is_true_for_a_forwarded_reply_and_false_for_an_error_reply() {
        let runtime = LuaRuntime::new(empty_backends());
        let stored = runtime.lua.create_userdata(McpResponse::from_bytes(b"STORED\r\n")).unwrap();
        runtime.lua.globals().set("resp", stored).unwrap();
        let ok: bool = runtime.lua.load("return resp:ok()").eval().unwrap();
        assert!(ok);

        let failed = runtime.lua.create_userdata(McpResponse::from_bytes(b"SERVER_ERROR oops\r\n")).unwrap();
        runtime.lua.globals().set("resp", failed).unwrap();
        let ok: bool = runtime.lua.load("return resp:ok()").eval().unwrap();
        assert!(!ok);
    }

    #[test]
    fn hash_selector_is_invoked_with_a_request_and_returns_a_pool_member() {
        let runtime = LuaRuntime::new(empty_backends());
        let request = Request::parse(Bytes::from_static(b"get foo\r\n")).unwrap();
        let selector = McpHashSelector {
            selector: crate::selector::HashSelector::new(2),
            pool: vec!["10.0.0.1:11211".to_owned(), "10.0.0.2:11211".to_owned()],
        };
        runtime.lua.globals().set("selector", selector).unwrap();
        runtime.lua.globals().set("request", McpRequest::from_request(&request)).unwrap();
        let name: String = runtime.lua.load("return selector(request).name").eval().unwrap();
        assert!(name == "10.0.0.1:11211" || name == "10.0.0.2:11211");
    }

    #[test]
    fn yielded_request_userdata_is_forwarded_as_its_raw_bytes() {
        let runtime = LuaRuntime::new(empty_backends());
        let server = McpServer { name: "10.0.0.1:11211".to_owned(), weight: 1 };
        runtime.lua.globals().set("srv", server).unwrap();
        runtime
            .lua
            .load("mcp.attach(mcp.CMD_GET, function(r) return coroutine.yield(srv, r) end)")
            .exec()
            .unwrap();
        let request = Request::parse(Bytes::from_static(b"get foo\r\n")).unwrap();
        match runtime.start(&request) {
            Resumption::Yielded { backend, request, .. } => {
                assert_eq!(backend, "10.0.0.1:11211");
                assert_eq!(&request[..], b"get foo\r\n");
            },
            _ => panic!("expected Yielded"),
        }
    }
}
