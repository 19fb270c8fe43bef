use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use rivulet::{
    bencode::{self, Dict, Value},
    bitfield::{Bitfield, RvtBitfield},
    config::ResolvedConfig,
    daemon::{Daemon, TorrentSource},
    disk::StorageTarget,
    error::Error,
    extensions::{Block, Core, CoreCodec, Handshake, HandshakeCodec},
    metainfo::{InfoHash, MetaInfo},
    peer::PeerId,
    torrent::{TorrentCtx, TorrentMsg},
    tracker::{
        action::Action, announce, connect, http::HttpTracker, udp::UdpTracker,
        AnnounceParams, Event, TrackerGroup,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    spawn,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, FramedParts};

const CONNECTION_ID: u64 = 0xdead_beef;

fn params(event: Event) -> AnnounceParams {
    AnnounceParams {
        info_hash: InfoHash([1u8; 20]),
        peer_id: PeerId([2u8; 20]),
        port: 6881,
        uploaded: 0,
        downloaded: 10,
        left: 1000,
        event,
        key: 0xabcd,
        num_want: Some(30),
    }
}

/// Serve connect and announce requests forever. The events of the
/// announces are sent on `events`, the first `lose` announces are never
/// answered.
async fn udp_tracker(
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    mut lose: usize,
    events: mpsc::UnboundedSender<u32>,
) {
    let mut buf = [0u8; 1024];

    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let buf = &buf[..len];

        if let Ok(req) = connect::Request::deserialize(buf) {
            let res = connect::Response {
                action: Action::Connect as u32,
                transaction_id: req.transaction_id,
                connection_id: CONNECTION_ID,
            };
            let _ = socket.send_to(&res.serialize().unwrap(), from).await;
            continue;
        }

        let req = announce::Request::deserialize(buf).unwrap();
        assert_eq!(req.connection_id, CONNECTION_ID);

        if lose > 0 {
            lose -= 1;
            continue;
        }
        let _ = events.send(req.event);

        let res = announce::Response {
            action: Action::Announce as u32,
            transaction_id: req.transaction_id,
            interval: 1800,
            leechers: 3,
            seeders: 4,
        };
        let mut out = res.serialize().unwrap();
        for peer in &peers {
            let SocketAddr::V4(peer) = peer else { continue };
            out.extend_from_slice(&peer.ip().octets());
            out.extend_from_slice(&peer.port().to_be_bytes());
        }
        let _ = socket.send_to(&out, from).await;
    }
}

async fn bind_udp() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

#[tokio::test]
async fn udp_announce_is_retransmitted() {
    let (socket, port) = bind_udp().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let peer = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 6881));
    spawn(udp_tracker(socket, vec![peer], 1, tx));

    let mut tracker = UdpTracker::new(&format!("udp://127.0.0.1:{port}"))
        .unwrap()
        .with_retransmit_base(Duration::from_millis(50));

    let res = tracker.announce(&params(Event::Started)).await.unwrap();
    assert_eq!(res.interval, Duration::from_secs(1800));
    assert_eq!(res.peers, vec![peer]);
    assert_eq!(res.seeders, Some(4));
    assert_eq!(res.leechers, Some(3));
    assert_eq!(rx.recv().await, Some(Event::Started as u32));

    // the connection id is reused
    tracker.announce(&params(Event::None)).await.unwrap();
    assert_eq!(rx.recv().await, Some(Event::None as u32));
}

#[tokio::test]
async fn udp_tracker_that_never_answers() {
    let (socket, port) = bind_udp().await;

    let mut tracker = UdpTracker::new(&format!("udp://127.0.0.1:{port}"))
        .unwrap()
        .with_retransmit_base(Duration::from_millis(10));

    let r = tracker.announce(&params(Event::Started)).await;
    assert!(matches!(r, Err(Error::Timeout)), "{r:?}");
    drop(socket);
}

/// Answer one HTTP request with `body`, returns the request line.
async fn http_once(listener: &TcpListener, body: &[u8]) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();

    let mut req = Vec::new();
    let mut buf = [0u8; 1024];
    while !req.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0);
        req.extend_from_slice(&buf[..n]);
    }

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    socket.write_all(head.as_bytes()).await.unwrap();
    socket.write_all(body).await.unwrap();
    socket.shutdown().await.unwrap();

    let req = String::from_utf8_lossy(&req).into_owned();
    req.lines().next().unwrap_or_default().to_owned()
}

#[tokio::test]
async fn http_announce() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut dict = Dict::new();
    dict.insert("interval", 900_i64);
    dict.insert("min interval", 60_i64);
    dict.insert("peers", vec![10u8, 0, 0, 2, 0x1a, 0xe1]);
    dict.insert("tracker id", "abc");
    let body = bencode::encode(&Value::Dict(dict));

    let server = spawn(async move {
        let first = http_once(&listener, &body).await;
        let mut failure = Dict::new();
        failure.insert("failure reason", "unregistered torrent");
        let second =
            http_once(&listener, &bencode::encode(&failure.into())).await;
        (first, second)
    });

    let url = format!("http://127.0.0.1:{port}/announce");
    let mut tracker = HttpTracker::new(&url).unwrap();

    let res = tracker.announce(&params(Event::Started)).await.unwrap();
    assert_eq!(res.interval, Duration::from_secs(900));
    assert_eq!(res.min_interval, Some(Duration::from_secs(60)));
    assert_eq!(
        res.peers,
        vec![SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 6881))]
    );

    match tracker.announce(&params(Event::None)).await {
        Err(Error::TrackerFailure(m)) => assert_eq!(m, "unregistered torrent"),
        r => panic!("unexpected {r:?}"),
    }

    let (first, second) = server.await.unwrap();
    assert!(first.starts_with("GET /announce?info_hash="));
    assert!(first.contains(&"%01".repeat(20)));
    assert!(first.contains("&compact=1"));
    assert!(first.contains("&event=started"));
    assert!(first.contains("&numwant=30"));
    assert!(!second.contains("event="));
    // the tracker id of the first response is echoed
    assert!(second.contains("&trackerid=abc"));
}

async fn next(events: &mut mpsc::UnboundedReceiver<u32>) -> Option<u32> {
    timeout(Duration::from_secs(10), events.recv()).await.unwrap()
}

/// A seeder of one piece for the torrent announced by the tracker.
async fn seeder(listener: TcpListener, info_hash: InfoHash, data: Vec<u8>) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);
    let _ = socket.next().await;
    socket.send(Handshake::new(info_hash, PeerId::generate())).await.unwrap();

    let old = socket.into_parts();
    let mut parts = FramedParts::new::<Core>(old.io, CoreCodec);
    parts.read_buf = old.read_buf;
    let mut socket = Framed::from_parts(parts);

    let mut bitfield = Bitfield::from_piece(1);
    bitfield.fill(true);
    socket.send(Core::Bitfield(bitfield)).await.unwrap();
    socket.send(Core::Unchoke).await.unwrap();

    while let Some(Ok(msg)) = socket.next().await {
        if let Core::Request(b) = msg {
            let start = b.begin as usize;
            let block = data[start..start + b.len as usize].to_vec();
            let block = Block { index: b.index, begin: b.begin, block };
            socket.send(Core::Piece(block)).await.unwrap();
        }
    }
}

#[tokio::test]
async fn torrent_announces_its_lifecycle() {
    let data = vec![7u8; 5000];
    let (socket, tracker_port) = bind_udp().await;
    let peer_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = peer_listener.local_addr().unwrap();

    let mut info = Dict::new();
    info.insert("length", data.len() as i64);
    info.insert("name", "lifecycle.bin");
    info.insert("piece length", 16384_i64);
    let hash = sha1_smol::Sha1::from(&data).digest().bytes();
    info.insert("pieces", hash.to_vec());

    let mut root = Dict::new();
    root.insert("announce", format!("udp://127.0.0.1:{tracker_port}"));
    root.insert("info", info);
    let meta_info =
        MetaInfo::from_bytes(&bencode::encode(&root.into())).unwrap();
    let info_hash = meta_info.info_hash();

    let (tx, mut events) = mpsc::unbounded_channel();
    spawn(udp_tracker(socket, vec![peer], 0, tx));
    spawn(seeder(peer_listener, info_hash.clone(), data));

    let config = ResolvedConfig { local_peer_port: 0, ..Default::default() };
    let daemon = Daemon::new(config);
    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();

    let session = daemon.session(&info_hash).await.unwrap();
    timeout(Duration::from_secs(20), session.wait_complete())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(next(&mut events).await, Some(Event::Started as u32));
    assert_eq!(next(&mut events).await, Some(Event::Completed as u32));

    daemon.shutdown().await;
    assert_eq!(next(&mut events).await, Some(Event::Stopped as u32));
}

#[tokio::test]
async fn cancelled_while_the_torrent_is_full() {
    let (socket, port) = bind_udp().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let peer = SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 6881));
    spawn(udp_tracker(socket, vec![peer], 0, tx));

    // nobody reads the channel of the torrent
    let (torrent_tx, _torrent_rx) = mpsc::channel(1);
    torrent_tx.try_send(TorrentMsg::Start).unwrap();

    let ctx = Arc::new(TorrentCtx::new(
        InfoHash([1u8; 20]),
        PeerId::generate(),
        Arc::new(ResolvedConfig::default()),
        torrent_tx,
        Some(1000),
    ));
    let group = TrackerGroup::new([(format!("udp://127.0.0.1:{port}"), 0)]);
    let handles = group.spawn(ctx.clone());

    assert_eq!(next(&mut events).await, Some(Event::Started as u32));
    // let the loop block on handing over the peers
    sleep(Duration::from_millis(200)).await;
    ctx.cancel.cancel();

    for handle in handles {
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
    assert_eq!(next(&mut events).await, Some(Event::Stopped as u32));
}
