use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One chat record, used in both directions on the wire.
///
/// Clients only fill in `user_name` and `content`. The relay overwrites
/// `user_id`, `message_id` and `timestamp` before fanning the message out, so
/// whatever a client sends in those fields never reaches another peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
}

impl ChatMessage {
    /// Builds a client-side message; server-assigned fields stay empty.
    pub fn outgoing(user_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Reads the next record from a relay stream.
///
/// Records are newline-delimited JSON and blank lines between them are
/// skipped. `Ok(None)` means the peer hung up. A line that does not decode is
/// reported as `InvalidData`, which the relay treats as fatal for that session.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes one record and flushes, so a queued chat line is on the socket
/// before the writer waits for the next one.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
