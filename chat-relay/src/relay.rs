use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{hub::Hub, session::Session};

/// Tunables for a running relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Depth of each session's outbound queue.
    pub outbound_capacity: usize,
    /// Longest a single delivery may wait for room in a session's queue.
    pub delivery_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    hub: Arc<Hub>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new(config.delivery_timeout)),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            hub,
            config,
        } = self;
        let sessions_token = CancellationToken::new();
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let session = Session::open(
                                Arc::clone(&hub),
                                config.outbound_capacity,
                                &sessions_token,
                            );
                            sessions.spawn(handle_connection(stream, peer, session));
                        }
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
                // Reap finished sessions so the set does not grow without bound.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(sessions = sessions.len(), "relay shutting down");
        sessions_token.cancel();
        while sessions.join_next().await.is_some() {}

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, session: Session) {
    let identity = session.identity();
    info!(%identity, %peer, "client connected");

    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    match session.run(&mut reader, writer).await {
        Ok(()) => info!(%identity, %peer, "client disconnected"),
        Err(err) => warn!(%identity, %peer, error = ?err, "client connection closed with error"),
    }
}
