//! In-process message bus
//!
//! A router binds a named endpoint on the [`MessageBus`]. An outbound dealer
//! first registers its own unique endpoint ([`Transport::init`]), then posts
//! a rendezvous request to the router. The connection only becomes ready
//! once the router side adopts the pipe, i.e. once a session has been
//! created for it on the other end.
//!
//! Pipes are bounded channels of byte chunks. A full pipe suspends the
//! writer task of that connection and nothing else.

use crate::network::transport::{
    ConnectOutcome, FrameCodec, InboundConnection, Link, TransmitOutcome, Transport,
    TransportError, TransportEvent, TransportKind,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

/// Chunks buffered per pipe direction
const PIPE_CAPACITY: usize = 64;

/// Pending rendezvous requests per router
const BACKLOG: usize = 16;

struct Rendezvous {
    pipe: BusPipe,
}

#[derive(Default)]
struct Registry {
    routers: HashMap<String, mpsc::Sender<Rendezvous>>,
    dealers: HashSet<String>,
    next_dealer: u64,
}

/// Shared hub connecting dealers to routers by endpoint name
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<Registry>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a router endpoint
    pub fn bind(&self, endpoint: &str) -> Result<BusListener, TransportError> {
        let mut registry = self.inner.lock();
        if let Some(existing) = registry.routers.get(endpoint) {
            if !existing.is_closed() {
                return Err(TransportError::Bus(format!(
                    "endpoint {} already bound",
                    endpoint
                )));
            }
        }

        let (tx, rx) = mpsc::channel(BACKLOG);
        registry.routers.insert(endpoint.to_string(), tx);
        log::info!("Bus router bound to {}", endpoint);

        Ok(BusListener {
            endpoint: endpoint.to_string(),
            rx,
            bus: self.clone(),
        })
    }

    /// Whether a live router is bound at `endpoint`
    pub fn is_bound(&self, endpoint: &str) -> bool {
        self.inner
            .lock()
            .routers
            .get(endpoint)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Allocate a unique dealer endpoint
    pub fn register_dealer(&self) -> String {
        let mut registry = self.inner.lock();
        loop {
            registry.next_dealer += 1;
            let name = format!("dealer-{}", registry.next_dealer);
            if !registry.routers.contains_key(&name) && registry.dealers.insert(name.clone()) {
                return name;
            }
        }
    }

    fn release_dealer(&self, name: &str) {
        self.inner.lock().dealers.remove(name);
    }

    fn router(&self, endpoint: &str) -> Option<mpsc::Sender<Rendezvous>> {
        self.inner.lock().routers.get(endpoint).cloned()
    }

    fn unbind(&self, endpoint: &str) {
        let mut registry = self.inner.lock();
        if registry
            .routers
            .get(endpoint)
            .map_or(false, |tx| tx.is_closed())
        {
            registry.routers.remove(endpoint);
        }
    }
}

/// One end of a bus connection
pub struct BusPipe {
    dealer: String,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    /// Fired by the router side when a session adopts the pipe
    adopted: Option<oneshot::Sender<()>>,
}

/// Router side of a bound endpoint
pub struct BusListener {
    endpoint: String,
    rx: mpsc::Receiver<Rendezvous>,
    bus: MessageBus,
}

impl BusListener {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Wait for the next dealer
    pub async fn accept(&mut self) -> Option<InboundBus> {
        let rendezvous = self.rx.recv().await?;
        Some(InboundBus::new(rendezvous.pipe))
    }

    /// Accept until the receiving side goes away
    pub fn spawn(mut self, sink: mpsc::UnboundedSender<InboundConnection>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(conn) = self.accept().await {
                log::debug!("Bus rendezvous from {} on {}", conn.dealer(), self.endpoint);
                if sink.send(InboundConnection::Bus(conn)).is_err() {
                    break;
                }
            }
            log::debug!("Bus router {} stopped", self.endpoint);
        })
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.rx.close();
        self.bus.unbind(&self.endpoint);
    }
}

/// Reader and writer tasks over a pipe
fn spawn_link(
    pipe: BusPipe,
    mut codec: FrameCodec,
    sink: mpsc::Sender<TransportEvent>,
    ready: Option<oneshot::Receiver<()>>,
) -> Link {
    let BusPipe {
        dealer,
        tx: pipe_tx,
        rx: mut pipe_rx,
        ..
    } = pipe;
    let (tx, mut rx) = Link::queue();

    let mut write_codec = codec.clone();
    let write_sink = sink.clone();
    let write_dealer = dealer.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut buf = BytesMut::with_capacity(frame.header.len() + frame.body.len());
            if let Err(e) = write_codec.encode(frame, &mut buf) {
                let _ = write_sink
                    .send(TransportEvent::Closed(Some(e.to_string())))
                    .await;
                return;
            }
            if pipe_tx.send(buf.freeze()).await.is_err() {
                log::debug!("Bus pipe of {} closed by remote", write_dealer);
                let _ = write_sink
                    .send(TransportEvent::Closed(Some("bus pipe closed".to_string())))
                    .await;
                return;
            }
        }
    });

    let read_task = tokio::spawn(async move {
        if let Some(ready) = ready {
            if ready.await.is_err() {
                let _ = sink
                    .send(TransportEvent::Closed(Some(
                        "rendezvous not adopted".to_string(),
                    )))
                    .await;
                return;
            }
            if sink.send(TransportEvent::Ready).await.is_err() {
                return;
            }
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = pipe_rx.recv().await {
            buf.extend_from_slice(&chunk);
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if sink.send(TransportEvent::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = sink.send(TransportEvent::Closed(Some(e.to_string()))).await;
                        return;
                    }
                }
            }
        }
        log::debug!("Bus pipe of {} drained", dealer);
        let _ = sink.send(TransportEvent::Closed(None)).await;
    });

    Link::new(tx, read_task)
}

/// Dealer side: connects to a router endpoint
pub struct OutboundBus {
    bus: MessageBus,
    endpoint: String,
    dealer: Option<String>,
    pending: Option<(BusPipe, oneshot::Receiver<()>)>,
    link: Option<Link>,
}

impl OutboundBus {
    pub fn new(bus: MessageBus, endpoint: &str) -> Self {
        Self {
            bus,
            endpoint: endpoint.to_string(),
            dealer: None,
            pending: None,
            link: None,
        }
    }
}

#[async_trait]
impl Transport for OutboundBus {
    fn kind(&self) -> TransportKind {
        TransportKind::OutboundBus
    }

    async fn init(&mut self) -> Result<Option<String>, TransportError> {
        let dealer = match &self.dealer {
            Some(dealer) => dealer.clone(),
            None => {
                let dealer = self.bus.register_dealer();
                self.dealer = Some(dealer.clone());
                dealer
            }
        };
        Ok(Some(dealer))
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, TransportError> {
        let dealer = self.dealer.clone().ok_or(TransportError::NotConnected)?;
        let router = self
            .bus
            .router(&self.endpoint)
            .ok_or_else(|| TransportError::Refused(format!("no router at {}", self.endpoint)))?;

        let (to_router, from_dealer) = mpsc::channel(PIPE_CAPACITY);
        let (to_dealer, from_router) = mpsc::channel(PIPE_CAPACITY);
        let (adopted_tx, adopted_rx) = oneshot::channel();

        let remote = BusPipe {
            dealer: dealer.clone(),
            tx: to_dealer,
            rx: from_dealer,
            adopted: Some(adopted_tx),
        };
        router
            .send(Rendezvous { pipe: remote })
            .await
            .map_err(|_| TransportError::Refused(format!("router {} gone", self.endpoint)))?;

        let local = BusPipe {
            dealer: dealer.clone(),
            tx: to_router,
            rx: from_router,
            adopted: None,
        };
        self.pending = Some((local, adopted_rx));

        Ok(ConnectOutcome {
            ready: false,
            dealer_endpoint: Some(dealer),
        })
    }

    fn on_connect(
        &mut self,
        codec: FrameCodec,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let (pipe, adopted) = self.pending.take().ok_or(TransportError::NotConnected)?;
        self.link = Some(spawn_link(pipe, codec, sink, Some(adopted)));
        Ok(())
    }

    fn transmit(&mut self, header: Bytes, body: Bytes) -> TransmitOutcome {
        match &self.link {
            Some(link) => link.transmit(header, body),
            None => TransmitOutcome::Closed,
        }
    }

    async fn shutdown(&mut self) {
        self.pending = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        if let Some(dealer) = self.dealer.take() {
            self.bus.release_dealer(&dealer);
        }
    }
}

/// Router side of one accepted dealer
pub struct InboundBus {
    dealer: String,
    pipe: Option<BusPipe>,
    link: Option<Link>,
}

impl InboundBus {
    fn new(pipe: BusPipe) -> Self {
        Self {
            dealer: pipe.dealer.clone(),
            pipe: Some(pipe),
            link: None,
        }
    }

    /// Endpoint name of the remote dealer
    pub fn dealer(&self) -> &str {
        &self.dealer
    }
}

#[async_trait]
impl Transport for InboundBus {
    fn kind(&self) -> TransportKind {
        TransportKind::InboundBus
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, TransportError> {
        if self.pipe.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(ConnectOutcome {
            ready: true,
            dealer_endpoint: Some(self.dealer.clone()),
        })
    }

    fn on_connect(
        &mut self,
        codec: FrameCodec,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut pipe = self.pipe.take().ok_or(TransportError::NotConnected)?;
        if let Some(adopted) = pipe.adopted.take() {
            if adopted.send(()).is_err() {
                return Err(TransportError::Bus(format!(
                    "dealer {} went away",
                    self.dealer
                )));
            }
        }
        self.link = Some(spawn_link(pipe, codec, sink, None));
        Ok(())
    }

    fn transmit(&mut self, header: Bytes, body: Bytes) -> TransmitOutcome {
        match &self.link {
            Some(link) => link.transmit(header, body),
            None => TransmitOutcome::Closed,
        }
    }

    async fn shutdown(&mut self) {
        self.pipe = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Chain;
    use crate::network::message::Message;
    use crate::network::wire;

    fn codec() -> FrameCodec {
        FrameCodec::new(wire::HEADER_SIZE, wire::body_size(Chain::Regtest.magic()))
    }

    #[test]
    fn test_bind_twice_fails() {
        let bus = MessageBus::new();
        let _listener = bus.bind("relay").unwrap();
        assert!(bus.bind("relay").is_err());
        assert!(bus.is_bound("relay"));
    }

    #[test]
    fn test_rebind_after_drop() {
        let bus = MessageBus::new();
        drop(bus.bind("relay").unwrap());
        assert!(!bus.is_bound("relay"));
        assert!(bus.bind("relay").is_ok());
    }

    #[test]
    fn test_dealers_are_unique() {
        let bus = MessageBus::new();
        assert_ne!(bus.register_dealer(), bus.register_dealer());
    }

    #[tokio::test]
    async fn test_connect_without_router_refused() {
        let bus = MessageBus::new();
        let mut outbound = OutboundBus::new(bus, "nowhere");
        outbound.init().await.unwrap();
        assert!(matches!(
            outbound.connect().await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_init() {
        let bus = MessageBus::new();
        let _listener = bus.bind("relay").unwrap();
        let mut outbound = OutboundBus::new(bus, "relay");
        assert!(matches!(
            outbound.connect().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_ready_after_adoption() {
        let bus = MessageBus::new();
        let mut listener = bus.bind("relay").unwrap();

        let mut outbound = OutboundBus::new(bus.clone(), "relay");
        let dealer = outbound.init().await.unwrap().unwrap();
        let outcome = outbound.connect().await.unwrap();
        assert!(!outcome.ready);
        assert_eq!(outcome.dealer_endpoint.as_deref(), Some(dealer.as_str()));

        let (out_tx, mut out_rx) = mpsc::channel(8);
        outbound.on_connect(codec(), out_tx).unwrap();

        let mut inbound = listener.accept().await.unwrap();
        assert_eq!(inbound.dealer(), dealer);
        assert!(inbound.connect().await.unwrap().ready);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        inbound.on_connect(codec(), in_tx).unwrap();

        assert!(matches!(out_rx.recv().await, Some(TransportEvent::Ready)));

        let magic = Chain::Regtest.magic();
        let (header, body) = wire::encode(magic, &Message::GetAddr).unwrap();
        assert_eq!(outbound.transmit(header, body), TransmitOutcome::Queued);
        match in_rx.recv().await {
            Some(TransportEvent::Frame(frame)) => {
                assert_eq!(wire::decode(magic, &frame).unwrap(), Message::GetAddr);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let (header, body) = wire::encode(magic, &Message::Pong(5)).unwrap();
        inbound.transmit(header, body);
        match out_rx.recv().await {
            Some(TransportEvent::Frame(frame)) => {
                assert_eq!(wire::decode(magic, &frame).unwrap(), Message::Pong(5));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_rendezvous_closes() {
        let bus = MessageBus::new();
        let mut listener = bus.bind("relay").unwrap();

        let mut outbound = OutboundBus::new(bus.clone(), "relay");
        outbound.init().await.unwrap();
        outbound.connect().await.unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        outbound.on_connect(codec(), out_tx).unwrap();

        drop(listener.accept().await.unwrap());
        assert!(matches!(
            out_rx.recv().await,
            Some(TransportEvent::Closed(Some(_)))
        ));
    }
}
