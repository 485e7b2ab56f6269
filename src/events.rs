//! Event definitions for the console event loop.
//!
//! The supervisor, relay tasks, rule watcher and signal listener all report
//! through one channel of [`Event`]s; the loop in `main` is the output sink.
//! Server events carry the display name, which is all the sink prints.

use crate::output::StreamKind;

#[derive(Debug, Clone)]
pub enum Event {
    /// A server is about to be spawned with the given command line.
    ServerStarting {
        name: String,
        command: String,
    },
    /// A server process was spawned and registered.
    ServerStarted {
        name: String,
        pid: Option<u32>,
    },
    /// A translated line of stdout or stderr.
    ServerOutput {
        name: String,
        line: String,
        stream: StreamKind,
    },
    /// An interrupt was delivered to a server.
    ServerSignalled { name: String },
    /// A server process exited and was deregistered. `None` means killed by a signal.
    ServerExited {
        name: String,
        code: Option<i32>,
    },
    /// The rule file changed and a new table is in effect.
    RulesReloaded { rules: usize },
    /// craftrack itself received Ctrl-C or SIGTERM.
    Shutdown,
}
