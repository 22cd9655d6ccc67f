use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Reply when a rename collides with a name that is already online.
pub const REPLY_NAME_TAKEN: &str = "该用户名已存在";
/// Reply when a private message names a recipient that is not online.
pub const REPLY_NO_SUCH_USER: &str = "该用户名不存在";
/// Reply when a private message carries an empty body.
pub const REPLY_EMPTY_BODY: &str = "无消息内容，请重发";
/// Reply when a `to|` line does not name a recipient.
pub const REPLY_BAD_DIRECT_FORMAT: &str = "消息格式不正确，请使用 \"to|xxx|message\"格式";
/// Final notice delivered before an idle participant is disconnected.
pub const EVICTION_NOTICE: &str = "你已被踢出";
/// Broadcast body announcing that a participant came online.
pub const JOIN_ANNOUNCEMENT: &str = "已上线";
/// Broadcast body announcing that a participant went offline.
pub const LEAVE_ANNOUNCEMENT: &str = "下线";

/// One parsed inbound line. Dispatch is by literal prefix, first match wins;
/// a line matching none of the command forms is a public broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `who`: list everyone currently online.
    Who,
    /// `rename|<new>`: change the sender's display name.
    Rename { new_name: String },
    /// `to|<recipient>|<message>`: private message for one participant.
    Direct { recipient: String, body: String },
    /// Anything else: the whole line is the broadcast body.
    Broadcast { text: String },
}

/// Parses one inbound line (terminator already stripped).
///
/// Only the first two `|` of a `to|` line are delimiters, so the message body
/// may itself contain `|`. A `to|` line without a second delimiter matches no
/// command form and falls through to a broadcast.
pub fn parse_command(line: &str) -> Command {
    if line == "who" {
        return Command::Who;
    }

    if let Some(rest) = line.strip_prefix("rename|") {
        if !rest.is_empty() {
            let new_name = rest.split_once('|').map_or(rest, |(first, _)| first);
            return Command::Rename {
                new_name: new_name.to_string(),
            };
        }
    }

    if let Some(rest) = line.strip_prefix("to|") {
        if let Some((recipient, body)) = rest.split_once('|') {
            return Command::Direct {
                recipient: recipient.to_string(),
                body: body.to_string(),
            };
        }
    }

    Command::Broadcast {
        text: line.to_string(),
    }
}

/// Formats a public line as every client sees it.
pub fn broadcast_line(name: &str, addr: SocketAddr, text: &str) -> String {
    format!("[{addr}]{name}:{text}")
}

/// Formats one entry of the `who` listing.
pub fn online_line(name: &str, addr: SocketAddr) -> String {
    format!("[{addr}]{name}在线")
}

/// Formats a private message as the recipient sees it.
pub fn direct_line(sender: &str, body: &str) -> String {
    format!("{sender}对你说：{body}")
}

/// Formats the confirmation for a successful rename.
pub fn rename_ok_line(new_name: &str) -> String {
    format!("已更新用户名：{new_name}")
}

/// Reads one line, stripping the terminator. Returns `None` once the peer
/// closes the stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes one line, appending the terminator and flushing so peers get timely
/// updates.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
