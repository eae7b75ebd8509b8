use std::sync::Arc;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    hub::Hub,
    message::{ChatMessage, read_message, write_message},
    registry::{Identity, Outbound},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Lifecycle of one accepted connection.
///
/// Dropping a session closes it, so the registry entry goes away whether the
/// inbound loop finished, failed, or the task running it was aborted.
pub struct Session {
    identity: Identity,
    hub: Arc<Hub>,
    closer: CancellationToken,
    outbound: Option<mpsc::Receiver<ChatMessage>>,
    state: SessionState,
}

impl Session {
    /// Assigns an identity and registers the outbound handle. The returned
    /// session is already `Active`.
    pub fn open(hub: Arc<Hub>, capacity: usize, shutdown: &CancellationToken) -> Self {
        let identity = hub.registry().next_identity();
        let closer = shutdown.child_token();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut session = Self {
            identity,
            hub,
            closer,
            outbound: Some(rx),
            state: SessionState::Connecting,
        };

        session
            .hub
            .registry()
            .register(identity, Outbound::new(tx, session.closer.clone()));
        session.transition(SessionState::Active);
        session
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the inbound loop until end of stream, a transport error, or
    /// cancellation, then closes the session.
    pub async fn run<R, W>(mut self, reader: &mut R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = match self.outbound.take() {
            Some(outbound) => {
                spawn_writer(self.identity, outbound, writer, self.closer.clone())
            }
            None => anyhow::bail!("session {} was already started", self.identity),
        };

        let outcome = self.read_inbound(reader).await;
        self.close();

        if let Err(error) = writer_task.await {
            debug!(identity = %self.identity, ?error, "outbound writer task ended abnormally");
        }

        outcome
    }

    async fn read_inbound<R>(&self, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            select! {
                biased;
                _ = self.closer.cancelled() => {
                    debug!(identity = %self.identity, "session cancelled");
                    return Ok(());
                }
                inbound = read_message::<_, ChatMessage>(reader) => {
                    match inbound? {
                        Some(message) => {
                            self.hub.broadcast(self.identity, message).await;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Enters `Closed`. Only the first call has any effect.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);
        self.closer.cancel();
        self.outbound = None;
        if self.hub.registry().remove(self.identity) {
            info!(identity = %self.identity, "client removed from chat");
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(identity = %self.identity, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_writer<W>(
    identity: Identity,
    mut outbound: mpsc::Receiver<ChatMessage>,
    mut writer: W,
    closer: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            select! {
                biased;
                _ = closer.cancelled() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(error) = write_message(&mut writer, &message).await {
                        debug!(%identity, ?error, "failed to write to client");
                        break;
                    }
                }
            }
        }
        // A dead writer takes the whole session down with it.
        closer.cancel();
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    struct Wire {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    fn wire() -> (Wire, Wire) {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        (
            Wire {
                reader: BufReader::new(client_read),
                writer: client_write,
            },
            Wire {
                reader: BufReader::new(server_read),
                writer: server_write,
            },
        )
    }

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn open_registers_and_activates() {
        let hub = hub();
        let shutdown = CancellationToken::new();

        let first = Session::open(Arc::clone(&hub), 8, &shutdown);
        let second = Session::open(Arc::clone(&hub), 8, &shutdown);

        assert_eq!(first.state(), SessionState::Active);
        assert_eq!(first.identity().to_string(), "user_1");
        assert_eq!(second.identity().to_string(), "user_2");
        assert_eq!(hub.registry().len(), 2);
    }

    #[tokio::test]
    async fn close_happens_once_and_identity_is_not_reused() {
        let hub = hub();
        let shutdown = CancellationToken::new();

        let mut session = Session::open(Arc::clone(&hub), 8, &shutdown);
        let identity = session.identity();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!hub.registry().contains(identity));

        let next = Session::open(Arc::clone(&hub), 8, &shutdown);
        assert_ne!(next.identity(), identity);
    }

    #[tokio::test]
    async fn dropping_a_session_deregisters_it() {
        let hub = hub();
        let shutdown = CancellationToken::new();

        let session = Session::open(Arc::clone(&hub), 8, &shutdown);
        assert_eq!(hub.registry().len(), 1);
        drop(session);
        assert!(hub.registry().is_empty());
    }

    #[tokio::test]
    async fn sender_receives_its_own_echo() -> Result<()> {
        let hub = hub();
        let shutdown = CancellationToken::new();
        let (mut client, server) = wire();
        let Wire {
            reader: mut server_reader,
            writer: server_writer,
        } = server;

        let session = Session::open(Arc::clone(&hub), 8, &shutdown);
        let running =
            tokio::spawn(async move { session.run(&mut server_reader, server_writer).await });

        write_message(&mut client.writer, &ChatMessage::outgoing("Alice", "hi")).await?;
        let echo = timeout(WAIT, read_message::<_, ChatMessage>(&mut client.reader))
            .await??
            .expect("echo before close");
        assert_eq!(echo.user_id, "user_1");
        assert_eq!(echo.user_name, "Alice");
        assert_eq!(echo.content, "hi");

        client.writer.shutdown().await?;
        timeout(WAIT, running).await???;
        assert!(hub.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_ends_the_inbound_loop() -> Result<()> {
        let hub = hub();
        let shutdown = CancellationToken::new();
        let (_client, server) = wire();
        let Wire {
            reader: mut server_reader,
            writer: server_writer,
        } = server;

        let session = Session::open(Arc::clone(&hub), 8, &shutdown);
        let running =
            tokio::spawn(async move { session.run(&mut server_reader, server_writer).await });

        shutdown.cancel();
        timeout(WAIT, running).await???;
        assert!(hub.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_input_closes_with_error() -> Result<()> {
        let hub = hub();
        let shutdown = CancellationToken::new();
        let (mut client, server) = wire();
        let Wire {
            reader: mut server_reader,
            writer: server_writer,
        } = server;

        let session = Session::open(Arc::clone(&hub), 8, &shutdown);
        let running =
            tokio::spawn(async move { session.run(&mut server_reader, server_writer).await });

        client.writer.write_all(b"{oops\n").await?;
        let outcome = timeout(WAIT, running).await??;
        assert!(outcome.is_err());
        assert!(hub.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn aborted_task_still_deregisters() -> Result<()> {
        let hub = hub();
        let shutdown = CancellationToken::new();
        let (_client, server) = wire();
        let Wire {
            reader: mut server_reader,
            writer: server_writer,
        } = server;

        let session = Session::open(Arc::clone(&hub), 8, &shutdown);
        let running =
            tokio::spawn(async move { session.run(&mut server_reader, server_writer).await });
        assert_eq!(hub.registry().len(), 1);

        running.abort();
        let _ = running.await;
        assert!(hub.registry().is_empty());
        Ok(())
    }
}
