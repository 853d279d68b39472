//! Scripted remote peers for integration tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use node_peers::config::{Chain, NodeConfig};
use node_peers::network::message::BASIC_FILTER;
use node_peers::network::transport::{Frame, FrameCodec};
use node_peers::network::{wire, Message, ServiceFlags, VersionMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

pub const STEP: Duration = Duration::from_secs(5);

/// Configuration with short timers suitable for tests
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::for_chain(Chain::Regtest);
    config.preferred_services = ServiceFlags::NETWORK;
    config.timeouts.connect_interval = Duration::from_millis(50);
    config.timeouts.dispatch = Duration::from_millis(100);
    config.timeouts.dump = Duration::from_secs(3600);
    config
}

/// The remote end of a connection, driven by the test
pub struct ScriptedPeer {
    framed: Framed<TcpStream, FrameCodec>,
    chain: Chain,
}

impl ScriptedPeer {
    pub fn new(stream: TcpStream, chain: Chain) -> Self {
        let codec = FrameCodec::new(wire::HEADER_SIZE, wire::body_size(chain.magic()));
        Self {
            framed: Framed::new(stream, codec),
            chain,
        }
    }

    pub async fn accept(listener: &TcpListener, chain: Chain) -> Self {
        let (stream, _) = timeout(STEP, listener.accept())
            .await
            .expect("no connection")
            .unwrap();
        Self::new(stream, chain)
    }

    pub async fn connect(addr: SocketAddr, chain: Chain) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap(), chain)
    }

    pub async fn send(&mut self, message: &Message) {
        let (header, body) = wire::encode(self.chain.magic(), message).unwrap();
        self.framed.send(Frame { header, body }).await.unwrap();
    }

    /// Next message, or `None` when the session closed the connection
    pub async fn recv(&mut self) -> Option<Message> {
        let frame = timeout(STEP, self.framed.next())
            .await
            .expect("peer stayed silent")?
            .ok()?;
        Some(wire::decode(self.chain.magic(), &frame).unwrap())
    }

    /// Skip messages until one with the given command arrives
    pub async fn expect(&mut self, command: &str) -> Message {
        loop {
            match self.recv().await {
                Some(message) if message.command() == command => return message,
                Some(_) => continue,
                None => panic!("connection closed while waiting for {}", command),
            }
        }
    }

    /// Wait until the session hangs up, ignoring anything it still sends
    pub async fn expect_closed(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub fn version(services: ServiceFlags) -> Message {
        Message::Version(VersionMessage::new(
            services,
            rand::random(),
            "/scripted:0.1/".to_string(),
            0,
            true,
        ))
    }

    /// Answer the handshake of an outbound session
    pub async fn answer_handshake(&mut self, services: ServiceFlags) {
        self.expect("version").await;
        self.send(&Self::version(services)).await;
        self.send(&Message::VerAck).await;
        self.expect("verack").await;
    }

    /// Open the handshake towards an inbound session
    pub async fn open_handshake(&mut self, services: ServiceFlags) {
        self.send(&Self::version(services)).await;
        self.expect("version").await;
        self.expect("verack").await;
        self.send(&Message::VerAck).await;
    }
}

/// Serve one connection like an honest node until it closes
pub async fn serve_honestly(stream: TcpStream, chain: Chain, services: ServiceFlags) {
    let mut peer = ScriptedPeer::new(stream, chain);
    let checkpoint = chain.checkpoint();

    loop {
        let message = match timeout(Duration::from_secs(3600), peer.framed.next()).await {
            Ok(Some(Ok(frame))) => match wire::decode(chain.magic(), &frame) {
                Ok(message) => message,
                Err(_) => return,
            },
            _ => return,
        };

        match message {
            Message::Version(_) => {
                peer.send(&ScriptedPeer::version(services)).await;
                peer.send(&Message::VerAck).await;
            }
            Message::GetHeaders { locator, stop } => {
                let headers = if locator.is_empty() && stop == checkpoint.header_hash {
                    vec![chain.genesis_header()]
                } else {
                    Vec::new()
                };
                peer.send(&Message::Headers(headers)).await;
            }
            Message::GetCFHeaders { stop_hash, .. } => {
                peer.send(&Message::CFHeaders {
                    filter_type: BASIC_FILTER,
                    stop_hash,
                    previous_filter_header: node_peers::Hash256::ZERO,
                    filter_hashes: vec![chain.genesis_filter_hash()],
                })
                .await;
            }
            Message::Ping(nonce) => peer.send(&Message::Pong(nonce)).await,
            Message::GetAddr => peer.send(&Message::Addr(Vec::new())).await,
            _ => {}
        }
    }
}

/// Listener accepting any number of honest connections
pub async fn spawn_honest_node(chain: Chain, services: ServiceFlags) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_honestly(stream, chain, services));
        }
    });
    (addr, task)
}

/// A loopback address nobody listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
