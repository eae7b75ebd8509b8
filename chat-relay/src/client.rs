use std::io::BufRead;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cli::ClientArgs,
    message::{ChatMessage, read_message, write_message},
};

const DEFAULT_NAME: &str = "Anonymous";
const NAME_PROMPT: &str = "Enter your username: ";

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut lines = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();

    let user_name = match args.name {
        Some(name) => display_name(&name),
        None => prompt_for_name(&mut lines, &mut stdout).await?,
    };

    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    converse(&user_name, &mut lines, &mut stdout, BufReader::new(reader), writer).await
}

/// Feeds stdin lines into a channel from a plain thread.
///
/// The thread is never joined. A read blocked on the terminal must not keep
/// the process alive once the relay connection is gone, which is what
/// happens when the blocking read belongs to the runtime's own pool.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    debug!(?error, "stopped reading stdin");
                    break;
                }
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs the send and receive loops against one relay connection until either
/// side stops, then reports the disconnect on `output`.
///
/// `lines` yields user input without line terminators; a closed channel means
/// the user is done.
pub async fn converse<O, R, W>(
    user_name: &str,
    lines: &mut mpsc::Receiver<String>,
    output: &mut O,
    mut server_reader: R,
    mut server_writer: W,
) -> Result<()>
where
    O: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cancel = CancellationToken::new();

    let sending = async {
        let outcome = send_loop(user_name, lines, &mut server_writer, &cancel).await;
        cancel.cancel();
        outcome
    };
    let receiving = async {
        let outcome = receive_loop(&mut server_reader, output, &cancel).await;
        cancel.cancel();
        outcome
    };
    let (sent, received) = tokio::join!(sending, receiving);

    if let Err(err) = sent {
        write_line(output, &format!("Error sending message: {err}")).await?;
    }
    if let Err(err) = received {
        write_line(output, &format!("Error receiving message: {err}")).await?;
    }

    // Best effort; the relay may already be gone.
    let _ = server_writer.shutdown().await;
    write_line(output, "Disconnected from chat").await?;
    Ok(())
}

async fn prompt_for_name<O>(lines: &mut mpsc::Receiver<String>, output: &mut O) -> Result<String>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(NAME_PROMPT.as_bytes()).await?;
    output.flush().await?;

    let answer = lines.recv().await.unwrap_or_default();
    Ok(display_name(&answer))
}

fn display_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

async fn send_loop<W>(
    user_name: &str,
    lines: &mut mpsc::Receiver<String>,
    server_writer: &mut W,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.recv() => {
                let Some(line) = line else {
                    return Ok(());
                };
                let content = line.trim_end_matches('\r');
                if content.trim().is_empty() {
                    continue;
                }
                write_message(server_writer, &ChatMessage::outgoing(user_name, content)).await?;
            }
        }
    }
}

async fn receive_loop<R, O>(
    server_reader: &mut R,
    output: &mut O,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut announced = false;
    loop {
        select! {
            _ = cancel.cancelled() => return Ok(()),
            message = read_message::<_, ChatMessage>(server_reader) => {
                let Some(message) = message? else {
                    return Ok(());
                };
                // There is no handshake, so the first message stands in for one.
                // It is normally this client's own echo, but a peer that speaks
                // before this user's first line arrives wins the race and its
                // identity is the one announced.
                if !announced {
                    announced = true;
                    let announcement = format!("[Connected] Your userId: {}", message.user_id);
                    write_line(output, &announcement).await?;
                }
                write_line(output, &render(&message)).await?;
            }
        }
    }
}

fn render(message: &ChatMessage) -> String {
    format!(
        "[{} ({})]: {}",
        message.user_name, message.user_id, message.content
    )
}

async fn write_line<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
