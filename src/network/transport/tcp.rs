//! TCP transports and the accept loop

use crate::network::transport::{
    ConnectOutcome, FrameCodec, InboundConnection, Link, TransmitOutcome, Transport,
    TransportError, TransportEvent, TransportKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Start the reader and writer tasks for a connected stream
fn spawn_link(
    stream: TcpStream,
    remote: SocketAddr,
    codec: FrameCodec,
    sink: mpsc::Sender<TransportEvent>,
) -> Link {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);
    let (tx, mut rx) = Link::queue();

    let write_sink = sink.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                log::debug!("Write to {} failed: {}", remote, e);
                let _ = write_sink
                    .send(TransportEvent::Closed(Some(e.to_string())))
                    .await;
                return;
            }
        }
        let _ = writer.close().await;
    });

    let read_task = tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    if sink.send(TransportEvent::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::debug!("Read from {} failed: {}", remote, e);
                    let _ = sink.send(TransportEvent::Closed(Some(e.to_string()))).await;
                    break;
                }
                None => {
                    let _ = sink.send(TransportEvent::Closed(None)).await;
                    break;
                }
            }
        }
    });

    Link::new(tx, read_task)
}

/// Connection we initiate
pub struct OutboundTcp {
    remote: SocketAddr,
    stream: Option<TcpStream>,
    link: Option<Link>,
}

impl OutboundTcp {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            stream: None,
            link: None,
        }
    }
}

#[async_trait]
impl Transport for OutboundTcp {
    fn kind(&self) -> TransportKind {
        TransportKind::OutboundTcp
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, TransportError> {
        let stream = TcpStream::connect(self.remote)
            .await
            .map_err(|e| TransportError::Refused(format!("{}: {}", self.remote, e)))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(ConnectOutcome::ready())
    }

    fn on_connect(
        &mut self,
        codec: FrameCodec,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        self.link = Some(spawn_link(stream, self.remote, codec, sink));
        Ok(())
    }

    fn transmit(&mut self, header: Bytes, body: Bytes) -> TransmitOutcome {
        match &self.link {
            Some(link) => link.transmit(header, body),
            None => TransmitOutcome::Closed,
        }
    }

    async fn shutdown(&mut self) {
        self.stream = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }
}

/// Connection accepted by a [`TcpAcceptor`]
pub struct InboundTcp {
    remote: SocketAddr,
    stream: Option<TcpStream>,
    link: Option<Link>,
}

impl InboundTcp {
    pub fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            remote,
            stream: Some(stream),
            link: None,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Transport for InboundTcp {
    fn kind(&self) -> TransportKind {
        TransportKind::InboundTcp
    }

    async fn connect(&mut self) -> Result<ConnectOutcome, TransportError> {
        if self.stream.is_none() {
            return Err(TransportError::NotConnected);
        }
        Ok(ConnectOutcome::ready())
    }

    fn on_connect(
        &mut self,
        codec: FrameCodec,
        sink: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        self.link = Some(spawn_link(stream, self.remote, codec, sink));
        Ok(())
    }

    fn transmit(&mut self, header: Bytes, body: Bytes) -> TransmitOutcome {
        match &self.link {
            Some(link) => link.transmit(header, body),
            None => TransmitOutcome::Closed,
        }
    }

    async fn shutdown(&mut self) {
        self.stream = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }
}

/// TCP listener handing accepted sockets to the pool
pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl TcpAcceptor {
    /// Bind to a socket address
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        log::info!("Listening on {}", local);
        Ok(Self { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept until the receiving side goes away
    pub fn spawn(self, sink: mpsc::UnboundedSender<InboundConnection>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.listener.accept().await {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted connection from {}", remote);
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("Cannot set nodelay for {}: {}", remote, e);
                        }
                        let conn = InboundConnection::Tcp(InboundTcp::new(stream, remote));
                        if sink.send(conn).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Accept on {} failed: {}", self.local, e);
                    }
                }
            }
            log::debug!("Listener on {} stopped", self.local);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Chain;
    use crate::network::message::Message;
    use crate::network::transport::SEND_QUEUE_CAPACITY;
    use crate::network::wire;

    fn codec() -> FrameCodec {
        FrameCodec::new(wire::HEADER_SIZE, wire::body_size(Chain::Regtest.magic()))
    }

    #[tokio::test]
    async fn test_outbound_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = OutboundTcp::new(addr);
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_send_queue_bounded_when_remote_stops_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut outbound = OutboundTcp::new(addr);
        outbound.connect().await.unwrap();
        // Accepted but never read
        let (_stalled, _) = listener.accept().await.unwrap();

        let (sink, _events) = mpsc::channel(8);
        outbound.on_connect(codec(), sink).unwrap();

        let header = Bytes::from(vec![0u8; wire::HEADER_SIZE]);
        let body = Bytes::from(vec![0u8; 1 << 20]);
        let mut queued = 0;
        let outcome = loop {
            match outbound.transmit(header.clone(), body.clone()) {
                TransmitOutcome::Queued => queued += 1,
                other => break other,
            }
            assert!(queued <= SEND_QUEUE_CAPACITY + 64, "send queue never filled");
        };
        assert_eq!(outcome, TransmitOutcome::Full);
        assert!(queued >= SEND_QUEUE_CAPACITY);

        outbound.shutdown().await;
    }

    #[tokio::test]
    async fn test_frames_cross_loopback() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
        acceptor.spawn(accept_tx);

        let mut outbound = OutboundTcp::new(addr);
        assert!(outbound.connect().await.unwrap().ready);
        let (out_tx, _out_rx) = mpsc::channel(8);
        outbound.on_connect(codec(), out_tx).unwrap();

        let conn = accept_rx.recv().await.unwrap();
        assert!(conn.remote_address(Chain::Regtest).incoming);
        let mut inbound = conn.into_transport();
        assert_eq!(inbound.kind(), TransportKind::InboundTcp);
        assert!(inbound.connect().await.unwrap().ready);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        inbound.on_connect(codec(), in_tx).unwrap();

        let magic = Chain::Regtest.magic();
        let (header, body) = wire::encode(magic, &Message::Ping(42)).unwrap();
        assert_eq!(outbound.transmit(header, body), TransmitOutcome::Queued);

        match in_rx.recv().await.unwrap() {
            TransportEvent::Frame(frame) => {
                assert_eq!(wire::decode(magic, &frame).unwrap(), Message::Ping(42));
            }
            other => panic!("unexpected event {:?}", other),
        }

        outbound.shutdown().await;
        assert_eq!(
            outbound.transmit(Bytes::new(), Bytes::new()),
            TransmitOutcome::Closed
        );
        match in_rx.recv().await.unwrap() {
            TransportEvent::Closed(_) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
}
