//! Operator console: reads commands line by line, runs them against the
//! node and prints one reply per command.

use std::collections::BTreeMap;
use std::io;

use crossterm::style::{style, Color, Stylize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::message::{truncate_for_display, Key, Message, Value, DISPLAY_LIMIT};
use crate::node::Node;

pub const PROMPT: &str = "> ";
pub const OK: &str = "<OK>";

const OK_COLOR: Color = Color::Rgb {
    r: 166,
    g: 166,
    b: 166,
};
const ERROR_COLOR: Color = Color::Rgb { r: 184, g: 0, b: 0 };

/// What a single console command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value(Value),
    Dump(BTreeMap<Key, Value>),
    Failed(String),
    Unsupported,
    Shutdown,
}

pub async fn execute(node: &Node, command: Message) -> Response {
    let outcome = match command {
        Message::Get { key } => node.get(&key).await.map(Response::Value),
        Message::Put { key, value } => node.put(key, value).await.map(|()| Response::Ok),
        Message::Del { key } => node.delete(&key).await.map(|()| Response::Ok),
        Message::Store => node.store_all().await.map(Response::Dump),
        Message::Exit { .. } => {
            node.exit().await;
            Ok(Response::Shutdown)
        }
        other => {
            debug!(node = %node.id(), kind = other.keyword(), "peer-only command typed at console");
            Ok(Response::Unsupported)
        }
    };
    outcome.unwrap_or_else(|err| Response::Failed(sentence_case(&err.to_string())))
}

/// Formats a response for the terminal. `None` means nothing is printed.
pub fn render(response: &Response, color: bool) -> Option<String> {
    let paint = |text: &str, tint: Color| {
        if color {
            style(text).with(tint).to_string()
        } else {
            text.to_string()
        }
    };

    match response {
        Response::Ok => Some(paint(OK, OK_COLOR)),
        Response::Value(value) => Some(value.clone()),
        Response::Dump(entries) => {
            let json = serde_json::to_string_pretty(entries)
                .unwrap_or_else(|err| format!("failed to encode store: {err}"));
            Some(truncate_for_display(&json, DISPLAY_LIMIT).into_owned())
        }
        Response::Failed(reason) => Some(paint(reason, ERROR_COLOR)),
        Response::Unsupported => Some("Unsupported message type received".to_string()),
        Response::Shutdown => None,
    }
}

/// Runs the prompt loop until EXIT or end of input. Either way the node's
/// peers are told it is leaving and the node is stopped.
pub async fn run<R, W>(node: &Node, input: R, output: &mut W, color: bool) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            debug!(node = %node.id(), "console input closed");
            node.exit().await;
            return Ok(());
        };

        let response = match line.parse::<Message>() {
            Ok(command) => execute(node, command).await,
            Err(err) => {
                warn!(node = %node.id(), error = %err, "invalid console command");
                Response::Failed(err.to_string())
            }
        };

        if let Some(text) = render(&response, color) {
            output.write_all(text.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        if response == Response::Shutdown {
            return Ok(());
        }
    }
}

fn sentence_case(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
