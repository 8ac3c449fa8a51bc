use crate::server::Dispatcher;
use crate::transport::{TransportError, read_frame, write_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// TCP front end for one replica
///
/// Accepts clients and peers alike and serves each connection on its own
/// task, one request frame answered by one reply frame.
pub struct Listener {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl Listener {
    /// Bind to `addr`; port 0 picks a free port
    pub async fn bind(addr: &str, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            "Replica {} listening on {}",
            self.dispatcher.context().id(),
            self.local_addr()?
        );

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            debug!("Connection from {}", peer_addr);

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(socket, dispatcher).await {
                    error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        mut socket: TcpStream,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<(), TransportError> {
        socket.set_nodelay(true)?;
        while let Some(frame) = read_frame(&mut socket).await? {
            let reply = dispatcher.handle_frame(&frame).await;
            write_frame(&mut socket, &reply).await?;
        }
        debug!("Peer closed connection");
        Ok(())
    }
}
