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
//! The scriptable routing runtime (§4.2): one hook per command kind,
//! expressed as a suspendable Lua coroutine.
pub mod lua;

use crate::protocol::Command;

/// A binding target for `mcp.attach` -- either an exact command or the
/// wildcard every unmatched command falls through to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Mg,
    Ms,
    Md,
    Mn,
    Ma,
    Me,
    Get,
    Set,
    Delete,
    /// `CMD_ANY` -- consulted when no command-specific hook is attached.
    Any,
}

impl From<Command> for Hook {
    fn from(cmd: Command) -> Hook {
        match cmd {
            Command::Mg => Hook::Mg,
            Command::Ms => Hook::Ms,
            Command::Md => Hook::Md,
            Command::Mn => Hook::Mn,
            Command::Ma => Hook::Ma,
            Command::Me => Hook::Me,
            Command::Get => Hook::Get,
            Command::Set => Hook::Set,
            Command::Delete => Hook::Delete,
        }
    }
}
