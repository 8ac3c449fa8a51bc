use crate::server::Dispatcher;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Upper bound for a single frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("no replica listening at {0}")]
    Unreachable(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
}

/// Write one length-prefixed frame (4 bytes big-endian length, then body)
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWriteExt + Unpin,
{
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncReadExt + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// One request/response channel to a replica
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Next frame from the other side; waits until one arrives
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// Opens connections to replicas by address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        (**self).connect(addr).await
    }
}

/// Production TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        Ok(Box::new(TcpConnection { stream }))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        write_frame(&mut self.stream, &frame).await
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        read_frame(&mut self.stream)
            .await?
            .ok_or(TransportError::Closed)
    }
}

/// Transport that loses frames, for fault-injection runs
///
/// Every outbound and every inbound frame is independently dropped with
/// `loss_probability`. A lost inbound frame is skipped and the receiver keeps
/// waiting for the next one, so a lost reply looks like a hang to a caller
/// that does not bound its wait.
pub struct LossyConnector<C> {
    inner: C,
    loss_probability: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl<C: Connector> LossyConnector<C> {
    pub fn new(inner: C, loss_probability: f64) -> Self {
        Self::with_rng(inner, loss_probability, StdRng::from_entropy())
    }

    /// Deterministic loss pattern for tests
    pub fn with_seed(inner: C, loss_probability: f64, seed: u64) -> Self {
        Self::with_rng(inner, loss_probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(inner: C, loss_probability: f64, rng: StdRng) -> Self {
        Self {
            inner,
            loss_probability: loss_probability.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(rng)),
        }
    }
}

#[async_trait]
impl<C: Connector> Connector for LossyConnector<C> {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        let inner = self.inner.connect(addr).await?;
        Ok(Box::new(LossyConnection {
            inner,
            loss_probability: self.loss_probability,
            rng: Arc::clone(&self.rng),
        }))
    }
}

pub struct LossyConnection {
    inner: Box<dyn Connection>,
    loss_probability: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl LossyConnection {
    fn lose(&self) -> bool {
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_bool(self.loss_probability)
    }
}

#[async_trait]
impl Connection for LossyConnection {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.lose() {
            trace!("Dropping outbound frame of {} bytes", frame.len());
            return Ok(());
        }
        self.inner.send(frame).await
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let frame = self.inner.recv().await?;
            if !self.lose() {
                return Ok(frame);
            }
            trace!("Dropping inbound frame of {} bytes", frame.len());
        }
    }
}

/// In-process network for tests and single-process demos
///
/// Replicas register their dispatcher under their address. Frames still go
/// through the JSON codec, so the whole dispatch path is exercised. A replica
/// can be marked down, after which connects and sends to it fail.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    dispatchers: Arc<RwLock<HashMap<String, Arc<Dispatcher>>>>,
    down: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, addr: impl Into<String>, dispatcher: Arc<Dispatcher>) {
        self.dispatchers.write().await.insert(addr.into(), dispatcher);
    }

    pub async fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.write().await;
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    pub async fn is_down(&self, addr: &str) -> bool {
        self.down.read().await.contains(addr)
    }

    async fn lookup(&self, addr: &str) -> Result<Arc<Dispatcher>, TransportError> {
        if self.is_down(addr).await {
            return Err(TransportError::Unreachable(addr.to_string()));
        }
        self.dispatchers
            .read()
            .await
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(addr.to_string()))
    }
}

#[async_trait]
impl Connector for InMemoryNetwork {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.lookup(addr).await?;
        Ok(Box::new(InMemoryConnection {
            network: self.clone(),
            addr: addr.to_string(),
            replies: VecDeque::new(),
        }))
    }
}

pub struct InMemoryConnection {
    network: InMemoryNetwork,
    addr: String,
    replies: VecDeque<Bytes>,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let dispatcher = self.network.lookup(&self.addr).await?;
        let reply = dispatcher.handle_frame(&frame).await;
        self.replies.push_back(reply);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            // Nothing will ever arrive on this connection; behave like a
            // socket that stays silent.
            None => std::future::pending().await,
        }
    }
}
