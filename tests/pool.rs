//! Pool behaviour with real sessions over loopback TCP and the message bus

mod common;

use common::{closed_port, spawn_honest_node, test_config, ScriptedPeer, STEP};
use node_peers::config::Chain;
use node_peers::network::{
    AddrBook, Address, AddressSource, Connector, HeaderSync, JobSources, Message, MessageBus,
    NetAddr, PeerId, PeerInfo, PoolError, PoolHandle, PoolManager, ServiceFlags, SessionState,
    StatusEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};

const CHAIN: Chain = Chain::Regtest;

async fn next_status(rx: &mut broadcast::Receiver<StatusEvent>) -> StatusEvent {
    timeout(STEP, rx.recv())
        .await
        .expect("no status event")
        .expect("status bus closed")
}

/// Poll the peer list until `done` holds
async fn wait_for_peers(
    pool: &PoolHandle,
    done: impl Fn(&[PeerInfo]) -> bool,
) -> Vec<PeerInfo> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let peers = pool.peers().await.unwrap();
        if done(&peers) {
            return peers;
        }
        assert!(Instant::now() < deadline, "peers never settled: {:?}", peers);
        sleep(Duration::from_millis(25)).await;
    }
}

fn running(peers: &[PeerInfo]) -> usize {
    peers
        .iter()
        .filter(|p| p.state == SessionState::Run)
        .count()
}

#[tokio::test]
async fn test_duplicate_address_rejected() {
    let (remote, _node) = spawn_honest_node(CHAIN, ServiceFlags::NETWORK).await;
    let mut config = test_config();
    config.target_outgoing = 0;
    let book = Arc::new(AddrBook::new(CHAIN));
    let (pool, task) =
        PoolManager::start(&config, book, JobSources::idle(), Connector::new()).unwrap();

    let address = Address::from_socket_addr(remote, CHAIN, false);
    let first = pool.add_peer(address.clone()).await.unwrap();
    let err = pool.add_peer(address).await.unwrap_err();
    assert!(matches!(err, PoolError::Duplicate(_)));

    let peers = pool.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, first);

    pool.shutdown().await.unwrap();
    timeout(STEP, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (remote, _node) = spawn_honest_node(CHAIN, ServiceFlags::NETWORK).await;
    let mut config = test_config();
    config.target_outgoing = 0;
    let book = Arc::new(AddrBook::new(CHAIN));
    let (pool, _task) =
        PoolManager::start(&config, book, JobSources::idle(), Connector::new()).unwrap();
    let mut status = pool.subscribe_status();

    let id = pool
        .add_peer(Address::from_socket_addr(remote, CHAIN, false))
        .await
        .unwrap();
    wait_for_peers(&pool, |peers| running(peers) == 1).await;

    assert!(pool.disconnect(id, "test").await.unwrap());
    assert!(!pool.disconnect(id, "test").await.unwrap());
    assert!(!pool.disconnect(9999, "test").await.unwrap());
    assert!(pool.peers().await.unwrap().is_empty());

    // Exactly one disconnect notification for the peer
    sleep(Duration::from_millis(200)).await;
    let mut disconnects = 0;
    while let Ok(event) = status.try_recv() {
        if matches!(event, StatusEvent::Disconnected { id: gone, .. } if gone == id) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
}

#[tokio::test]
async fn test_target_converges_to_exactly_n() {
    let mut nodes = Vec::new();
    let book = Arc::new(AddrBook::new(CHAIN));
    for _ in 0..4 {
        let (remote, task) = spawn_honest_node(CHAIN, ServiceFlags::NETWORK).await;
        let mut address = Address::from_socket_addr(remote, CHAIN, false);
        address.services = ServiceFlags::NETWORK;
        book.add_or_update(&address);
        nodes.push(task);
    }

    let mut config = test_config();
    config.target_outgoing = 2;
    let (pool, _task) =
        PoolManager::start(&config, book, JobSources::idle(), Connector::new()).unwrap();

    let peers = wait_for_peers(&pool, |peers| running(peers) == 2).await;
    assert!(peers.iter().all(|p| !p.incoming && p.verified));

    // Stays at the target
    sleep(Duration::from_millis(500)).await;
    let peers = pool.peers().await.unwrap();
    assert_eq!(peers.len(), 2);

    // Replaces a lost peer
    let lost: PeerId = peers[0].id;
    pool.disconnect(lost, "test").await.unwrap();
    let peers = wait_for_peers(&pool, |peers| running(peers) == 2).await;
    assert!(peers.iter().all(|p| p.id != lost));
}

#[tokio::test]
async fn test_unreachable_configured_then_preferred() {
    let unreachable = closed_port().await;
    let (reachable, _node) = spawn_honest_node(CHAIN, ServiceFlags::NETWORK).await;

    let book = Arc::new(AddrBook::new(CHAIN));
    let mut preferred = Address::from_socket_addr(reachable, CHAIN, false);
    preferred.services = ServiceFlags::NETWORK;
    preferred.last_connected = Some(chrono::Utc::now().timestamp() - 3600);
    book.add_or_update(&preferred);

    let mut config = test_config();
    config.target_outgoing = 1;
    config.peers = vec![unreachable.to_string()];
    let (pool, _task) =
        PoolManager::start(&config, book.clone(), JobSources::idle(), Connector::new()).unwrap();
    let mut status = pool.subscribe_status();

    let a = Address::from_socket_addr(unreachable, CHAIN, false);
    let mut attempts = Vec::new();
    let mut b_id = None;
    while b_id.is_none() {
        match next_status(&mut status).await {
            StatusEvent::Connected { id, address, .. } => {
                attempts.push(address.clone());
                if address == preferred {
                    b_id = Some(id);
                }
            }
            _ => {}
        }
    }
    assert_eq!(attempts, vec![a, preferred.clone()]);

    let b_id = b_id.unwrap();
    loop {
        if let StatusEvent::StateChanged { id, state } = next_status(&mut status).await {
            if id == b_id && state == SessionState::Run {
                break;
            }
            assert!(id != b_id || state != SessionState::Shutdown);
        }
    }

    let peers = wait_for_peers(&pool, |peers| running(peers) == 1).await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, preferred);
    assert!(peers[0].verified);

    // The handshake refreshed the stored record
    let stored = book
        .find(&Default::default())
        .into_iter()
        .find(|a| *a == preferred)
        .unwrap();
    assert!(stored.last_connected > preferred.last_connected);
}

#[tokio::test]
async fn test_bus_peers_reach_run() {
    let bus = MessageBus::new();

    let mut server_config = test_config();
    server_config.target_outgoing = 0;
    let server_jobs = JobSources::new(
        Arc::new(HeaderSync::new(CHAIN)),
        Arc::new(node_peers::network::NoWork),
    );
    let (server, _server_task) = PoolManager::start(
        &server_config,
        Arc::new(AddrBook::new(CHAIN)),
        server_jobs,
        Connector::with_bus(bus.clone()),
    )
    .unwrap();
    let bound = server
        .add_listener(Address::bus("alpha", CHAIN, false))
        .await
        .unwrap();
    assert_eq!(bound.to_string(), "bus://alpha");

    let mut client_config = test_config();
    client_config.target_outgoing = 1;
    client_config.peers = vec!["bus://alpha".to_string()];
    let (client, _client_task) = PoolManager::start(
        &client_config,
        Arc::new(AddrBook::new(CHAIN)),
        JobSources::idle(),
        Connector::with_bus(bus.clone()),
    )
    .unwrap();

    let outbound = wait_for_peers(&client, |peers| running(peers) == 1).await;
    assert!(outbound[0].verified);
    assert!(!outbound[0].incoming);

    let inbound = wait_for_peers(&server, |peers| running(peers) == 1).await;
    assert!(inbound[0].incoming);
    assert!(!inbound[0].verified);

    client.shutdown().await.unwrap();
    wait_for_peers(&server, |peers| peers.is_empty()).await;
    server.shutdown().await.unwrap();
    assert!(!bus.is_bound("alpha"));
}

#[tokio::test]
async fn test_address_book_flushed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (remote, _node) = spawn_honest_node(CHAIN, ServiceFlags::NETWORK).await;

    let mut config = test_config();
    config.data_dir = dir.path().to_path_buf();
    config.peers = vec![remote.to_string()];
    config.target_outgoing = 1;

    let book = Arc::new(AddrBook::open(&config.addr_book_path(), CHAIN).unwrap());
    let (pool, task) =
        PoolManager::start(&config, book, JobSources::idle(), Connector::new()).unwrap();
    wait_for_peers(&pool, |peers| running(peers) == 1).await;

    pool.shutdown().await.unwrap();
    timeout(STEP, task).await.unwrap().unwrap();
    assert!(matches!(pool.peers().await, Err(PoolError::Stopped)));

    let reopened = AddrBook::open(&config.addr_book_path(), CHAIN).unwrap();
    assert_eq!(reopened.len(), 1);
    let record = reopened.find(&Default::default()).pop().unwrap();
    assert_eq!(record, Address::from_socket_addr(remote, CHAIN, false));
    assert!(record.last_connected.is_some());
    assert!(record.services.contains(ServiceFlags::NETWORK));
}

#[tokio::test]
async fn test_gossiped_addresses_reach_address_book() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = listener.local_addr().unwrap();

    let mut config = test_config();
    config.peers = vec![remote.to_string()];
    config.target_outgoing = 1;
    let book = Arc::new(AddrBook::new(CHAIN));
    let (pool, _task) =
        PoolManager::start(&config, book.clone(), JobSources::idle(), Connector::new()).unwrap();

    let mut peer = ScriptedPeer::accept(&listener, CHAIN).await;
    peer.answer_handshake(ServiceFlags::NETWORK).await;
    peer.expect("getheaders").await;
    peer.send(&Message::Headers(vec![CHAIN.genesis_header()])).await;
    peer.expect("getaddr").await;

    let mut gossiped = Address::parse("10.0.0.7:18444", CHAIN).unwrap();
    gossiped.services = ServiceFlags::NETWORK;
    peer.send(&Message::Addr(vec![NetAddr::from_address(&gossiped)]))
        .await;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !book.find(&Default::default()).contains(&gossiped) {
        assert!(Instant::now() < deadline, "gossiped address never stored");
        sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(pool.peers().await.unwrap().len(), 1);
}
