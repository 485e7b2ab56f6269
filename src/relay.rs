//! Per-process I/O relay.
//!
//! Two reader tasks drain a server's stdout and stderr through the
//! translator into the event channel. A single forwarding loop feeds caller
//! lines into the server's stdin until the caller types `stop`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::events::Event;
use crate::output::{decode_line, sanitize_text, StreamKind};
use crate::registry::ProcessHandle;
use crate::translate::Translator;

/// Console command that asks a server to shut itself down.
pub const STOP_COMMAND: &str = "stop";

/// Everything a reader task needs to tag and translate lines.
#[derive(Clone)]
pub struct RelayContext {
    pub id: String,
    pub name: String,
    pub translator: Arc<Translator>,
    pub strip_ansi: bool,
    pub tx: mpsc::Sender<Event>,
}

/// Reads `reader` line by line until end of stream.
///
/// Lines keep their relative order. If the receiving side is gone the stream
/// is still drained so the child never blocks on a full pipe.
pub async fn read_stream<R>(ctx: RelayContext, stream: StreamKind, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(instance = %ctx.id, ?stream, error = %err, "output stream closed");
                break;
            }
        }
        let text = sanitize_text(&decode_line(&buf), ctx.strip_ansi);
        let line = ctx.translator.translate(&text);
        let _ = ctx
            .tx
            .send(Event::ServerOutput {
                name: ctx.name.clone(),
                line,
                stream,
            })
            .await;
    }
}

/// What to do with one line of caller input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputCommand {
    /// Pass the line through unchanged.
    Forward(String),
    /// Send `stop` to the server, then stop forwarding.
    Stop,
}

impl InputCommand {
    /// Decides, in one place, whether a line is the stop sentinel.
    pub fn classify(line: String) -> Self {
        if line.trim().eq_ignore_ascii_case(STOP_COMMAND) {
            InputCommand::Stop
        } else {
            InputCommand::Forward(line)
        }
    }
}

/// Why a forwarding loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// The caller typed `stop`; it was relayed and forwarding ended.
    StopSent,
    /// The input source closed.
    InputClosed,
}

/// Relays caller lines into `handle`'s stdin.
///
/// Write failures are logged and do not end the loop; only the stop
/// sentinel or a closed input source does.
pub async fn forward_input(
    handle: &ProcessHandle,
    input: &mut mpsc::Receiver<String>,
) -> InputOutcome {
    while let Some(line) = input.recv().await {
        match InputCommand::classify(line) {
            InputCommand::Forward(text) => send_line(handle, &text).await,
            InputCommand::Stop => {
                send_line(handle, STOP_COMMAND).await;
                return InputOutcome::StopSent;
            }
        }
    }
    InputOutcome::InputClosed
}

async fn send_line(handle: &ProcessHandle, text: &str) {
    if let Err(err) = handle.write_line(text).await {
        tracing::warn!(instance = %handle.instance_id(), error = %err, "failed to forward input");
    }
}
