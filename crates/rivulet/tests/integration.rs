use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::{distributions::Alphanumeric, Rng};
use rivulet::{
    bencode::{self, Dict, Value},
    bitfield::{Bitfield, RvtBitfield},
    config::ResolvedConfig,
    daemon::{Daemon, TorrentSource},
    disk::{Storage, StorageTarget},
    extensions::{
        Block, BlockInfo, Core, CoreCodec, ExtMsg, ExtendedMessage, Extension,
        ExtensionKind, Handshake, HandshakeCodec, MetadataMsg,
    },
    magnet::Magnet,
    metainfo::{InfoHash, MetaInfo},
    peer::{ConnectionState, Direction, PeerId, PeerSource},
    pieces::Progress,
    torrent::TorrentSession,
};
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::Level;

const PIECE_LEN: usize = 16384;

/// The id that the fake peer chooses for ut_metadata, different from ours.
const REMOTE_METADATA_ID: u8 = 7;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .compact()
        .with_file(false)
        .without_time()
        .try_init();
}

fn config() -> ResolvedConfig {
    ResolvedConfig { local_peer_port: 0, ..Default::default() }
}

/// A single file torrent of `data`, returns the raw info and the bytes of
/// the metainfo file.
fn make_torrent(name: &str, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LEN) {
        let hash = sha1_smol::Sha1::from(chunk).digest().bytes();
        pieces.extend_from_slice(&hash);
    }

    let mut info = Dict::new();
    info.insert("length", data.len() as i64);
    info.insert("name", name);
    info.insert("piece length", PIECE_LEN as i64);
    info.insert("pieces", pieces);
    let raw_info = bencode::encode(&Value::Dict(info.clone()));

    let mut root = Dict::new();
    root.insert("info", info);
    let metainfo = bencode::encode(&Value::Dict(root));

    (raw_info, metainfo)
}

fn random_data(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

fn random_dir() -> std::path::PathBuf {
    let name: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!("rivulet-{name}"))
}

/// Switch the codec after the handshake, keeping what was buffered.
fn into_core(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, CoreCodec> {
    let old = socket.into_parts();
    let mut parts = FramedParts::new::<Core>(old.io, CoreCodec);
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    Framed::from_parts(parts)
}

/// A remote that has every piece of `data`. It answers block requests
/// and, when `raw_info` is given, ut_metadata requests. Returns the ids of
/// every extended message it received once the connection is closed.
async fn seed(
    mut socket: Framed<TcpStream, CoreCodec>,
    data: Vec<u8>,
    raw_info: Option<Vec<u8>>,
) -> Vec<u8> {
    let pieces = data.len().div_ceil(PIECE_LEN);
    let mut bitfield = Bitfield::from_piece(pieces);
    bitfield.fill(true);
    socket.send(Core::Bitfield(bitfield)).await.unwrap();

    if let Some(raw_info) = &raw_info {
        let ext = Extension {
            m: [(ExtensionKind::Metadata, REMOTE_METADATA_ID)]
                .into_iter()
                .collect(),
            metadata_size: Some(raw_info.len() as u32),
            ..Default::default()
        };
        let msg = ExtendedMessage(Extension::ID, ext.to_payload().unwrap());
        socket.send(msg.into()).await.unwrap();
    }

    socket.send(Core::Unchoke).await.unwrap();

    let mut ext_ids = Vec::new();

    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Core::Request(b) => {
                let start = b.index as usize * PIECE_LEN + b.begin as usize;
                let block = data[start..start + b.len as usize].to_vec();
                let block = Block { index: b.index, begin: b.begin, block };
                socket.send(Core::Piece(block)).await.unwrap();
            }
            Core::Extended(ExtendedMessage(id, payload)) => {
                ext_ids.push(id);
                if id != REMOTE_METADATA_ID {
                    continue;
                }
                let Some(raw_info) = &raw_info else { continue };
                let Ok(MetadataMsg::Request(piece)) =
                    MetadataMsg::from_payload(&payload)
                else {
                    continue;
                };
                let data = MetadataMsg::data(piece, raw_info).unwrap();
                // answered with the id that the downloader advertised
                let msg = ExtendedMessage(
                    ExtensionKind::Metadata.local_id(),
                    data.to_payload().unwrap(),
                );
                socket.send(msg.into()).await.unwrap();
            }
            _ => {}
        }
    }

    ext_ids
}

/// Accept one connection and handshake as the receiver.
async fn accept(
    listener: &TcpListener,
    info_hash: &InfoHash,
    ours: InfoHash,
) -> Framed<TcpStream, HandshakeCodec> {
    let (socket, _) = listener.accept().await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);

    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, *info_hash);

    socket.send(Handshake::new(ours, PeerId::generate())).await.unwrap();
    socket
}

async fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn wait_peer_state(
    session: &TorrentSession,
    addr: SocketAddr,
    state: ConnectionState,
) {
    timeout(Duration::from_secs(10), async {
        loop {
            let peers = session.peers().await.unwrap();
            if peers.iter().any(|p| p.addr == addr && p.state == Some(state)) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn download_from_seeder() {
    init_logs();

    let data = random_data(2 * PIECE_LEN);
    let (_, metainfo) = make_torrent("two_pieces.bin", &data);
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let (listener, addr) = local_listener().await;
    let dir = random_dir();

    let daemon = Daemon::new(config());
    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    let target = StorageTarget::Directory(dir.clone());
    daemon.submit(source, target, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();

    let session = daemon.session(&info_hash).await.unwrap();
    assert!(session.add_peer(addr, PeerSource::Tracker).await.unwrap());
    // already known
    assert!(!session.add_peer(addr, PeerSource::Tracker).await.unwrap());

    let expected = info_hash.clone();
    let seeder = spawn({
        let data = data.clone();
        async move {
            let socket = accept(&listener, &expected, expected.clone()).await;
            seed(into_core(socket), data, None).await
        }
    });

    timeout(Duration::from_secs(20), session.wait_complete())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        session.progress(),
        Progress {
            pieces_complete: 2,
            pieces_total: 2,
            bytes_done: 2 * PIECE_LEN as u64,
        }
    );

    let state = session.state().await.unwrap();
    assert_eq!(state.downloaded, 2 * PIECE_LEN as u64);

    let written = tokio::fs::read(dir.join("two_pieces.bin")).await.unwrap();
    assert_eq!(written, data);

    daemon.shutdown().await;
    timeout(Duration::from_secs(5), seeder).await.unwrap().unwrap();
    let _ = tokio::fs::remove_dir_all(dir).await;
}

#[tokio::test]
async fn handshake_with_other_info_hash_is_a_failure() {
    init_logs();

    let (_, metainfo) = make_torrent("rejected.bin", &random_data(PIECE_LEN));
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let (listener, addr) = local_listener().await;

    let daemon = Daemon::new(config());
    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();

    let session = daemon.session(&info_hash).await.unwrap();
    session.add_peer(addr, PeerSource::Pex).await.unwrap();

    let expected = info_hash.clone();
    spawn(async move {
        let mut socket =
            accept(&listener, &expected, InfoHash([9u8; 20])).await;
        // the downloader hangs up
        while let Some(Ok(_)) = socket.next().await {}
    });

    wait_peer_state(&session, addr, ConnectionState::Failed).await;

    let peers = session.peers().await.unwrap();
    let peer = peers.iter().find(|p| p.addr == addr).unwrap();
    assert_eq!(peer.failures, 1);
    assert!(!peer.excluded);
    assert_eq!(peer.source, PeerSource::Pex);
    assert!(!session.is_complete());

    daemon.shutdown().await;
}

#[tokio::test]
async fn info_from_magnet_with_remote_extension_ids() {
    init_logs();

    let data = random_data(PIECE_LEN + 100);
    let (raw_info, _) = make_torrent("from_magnet.bin", &data);
    let info_hash = InfoHash::of(&raw_info);

    let magnet =
        format!("magnet:?xt=urn:btih:{info_hash}&dn=from_magnet.bin");
    let source = TorrentSource::Magnet(Magnet::new(&magnet).unwrap());

    let (listener, addr) = local_listener().await;

    let daemon = Daemon::new(config());
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();

    let session = daemon.session(&info_hash).await.unwrap();
    assert!(session.ctx().content().is_none());
    session.add_peer(addr, PeerSource::Tracker).await.unwrap();

    let expected = info_hash.clone();
    let seeder = spawn({
        let data = data.clone();
        async move {
            let socket = accept(&listener, &expected, expected.clone()).await;
            seed(into_core(socket), data, Some(raw_info)).await
        }
    });

    timeout(Duration::from_secs(20), session.wait_complete())
        .await
        .unwrap()
        .unwrap();

    let content = session.ctx().content().unwrap();
    assert_eq!(content.info.name, "from_magnet.bin");
    assert_eq!(content.storage.read_at(0, data.len()).unwrap(), data);

    let progress = session.progress();
    assert_eq!(progress.pieces_complete, 2);
    assert_eq!(progress.bytes_done, data.len() as u64);

    daemon.shutdown().await;
    let ext_ids = timeout(Duration::from_secs(5), seeder)
        .await
        .unwrap()
        .unwrap();

    // the handshake, then metadata requests with the id we chose. Never
    // the ids of the downloader, nor an extension we didn't advertise.
    assert!(ext_ids.contains(&REMOTE_METADATA_ID));
    assert!(ext_ids
        .iter()
        .all(|id| *id == Extension::ID || *id == REMOTE_METADATA_ID));
}

#[tokio::test]
async fn inbound_peer_is_routed_to_its_torrent() {
    init_logs();

    let data = random_data(PIECE_LEN);
    let (_, metainfo) = make_torrent("inbound.bin", &data);
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let daemon = Daemon::new(config());
    let listen = daemon.listen().await.unwrap();
    let listen = SocketAddr::from(([127, 0, 0, 1], listen.port()));

    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();
    let session = daemon.session(&info_hash).await.unwrap();

    let socket = TcpStream::connect(listen).await.unwrap();
    let local = socket.local_addr().unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket
        .send(Handshake::new(info_hash.clone(), PeerId::generate()))
        .await
        .unwrap();

    let theirs = socket.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, info_hash);

    let seeder = spawn(seed(into_core(socket), data, None));

    wait_peer_state(&session, local, ConnectionState::Active).await;
    let peers = session.peers().await.unwrap();
    let peer = peers.iter().find(|p| p.addr == local).unwrap();
    assert_eq!(peer.source, PeerSource::Incoming);
    assert_eq!(peer.direction, Some(Direction::Inbound));

    timeout(Duration::from_secs(20), session.wait_complete())
        .await
        .unwrap()
        .unwrap();
    assert!(session.is_complete());

    daemon.shutdown().await;
    timeout(Duration::from_secs(5), seeder).await.unwrap().unwrap();
}

#[tokio::test]
async fn released_session_cancels_waiters() {
    init_logs();

    let (_, metainfo) = make_torrent("released.bin", &random_data(100));
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let daemon = Daemon::new(config());
    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    let session = daemon.session(&info_hash).await.unwrap();

    let waiter = spawn({
        let session = session.clone();
        async move { session.wait_complete().await }
    });

    daemon.delete(&info_hash).await.unwrap();
    let r = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(r.is_err());

    // released twice is fine
    session.release();
    assert!(session.start().await.is_err());
}

/// A remote that handshakes as `id` and hangs up right after, on every
/// connection. Each connection is reported on `dials`.
async fn hang_up(
    listener: TcpListener,
    info_hash: InfoHash,
    id: PeerId,
    dials: mpsc::UnboundedSender<()>,
) {
    while let Ok((socket, _)) = listener.accept().await {
        let _ = dials.send(());
        let mut socket = Framed::new(socket, HandshakeCodec);
        if let Some(Ok(_)) = socket.next().await {
            let _ = socket.send(Handshake::new(info_hash.clone(), id)).await;
        }
    }
}

#[tokio::test]
async fn failing_peer_is_excluded() {
    init_logs();

    let (_, metainfo) = make_torrent("excluded.bin", &random_data(PIECE_LEN));
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let config = ResolvedConfig {
        max_peer_failures: 2,
        reconnect_after: Duration::ZERO,
        ..config()
    };
    let daemon = Daemon::new(config);
    let listen = daemon.listen().await.unwrap();
    let listen = SocketAddr::from(([127, 0, 0, 1], listen.port()));

    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();
    let session = daemon.session(&info_hash).await.unwrap();

    let (listener, addr) = local_listener().await;
    let id = PeerId::generate();
    let (tx, mut dials) = mpsc::unbounded_channel();
    spawn(hang_up(listener, info_hash.clone(), id, tx));

    assert!(session.add_peer(addr, PeerSource::Tracker).await.unwrap());

    timeout(Duration::from_secs(10), async {
        loop {
            let peers = session.peers().await.unwrap();
            if peers.iter().any(|p| p.addr == addr && p.excluded) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let peers = session.peers().await.unwrap();
    let peer = peers.iter().find(|p| p.addr == addr).unwrap();
    assert_eq!(peer.failures, 2);
    assert_eq!(peer.state, Some(ConnectionState::Failed));
    assert_eq!(peer.id, Some(id));

    // more than a tick of the connect loop
    sleep(Duration::from_secs(6)).await;
    let mut n = 0;
    while dials.try_recv().is_ok() {
        n += 1;
    }
    assert_eq!(n, 2);

    assert!(!session.add_peer(addr, PeerSource::Pex).await.unwrap());

    // the same identity dialing us from another port
    let socket = TcpStream::connect(listen).await.unwrap();
    let mut socket = Framed::new(socket, HandshakeCodec);
    socket.send(Handshake::new(info_hash.clone(), id)).await.unwrap();
    let r = timeout(Duration::from_secs(5), socket.next()).await.unwrap();
    assert!(!matches!(r, Some(Ok(_))), "{r:?}");

    let peers = session.peers().await.unwrap();
    assert_eq!(peers.len(), 1);

    daemon.shutdown().await;
}

/// Read messages until `n` block requests arrived.
async fn requests(
    socket: &mut Framed<TcpStream, CoreCodec>,
    n: usize,
) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    while blocks.len() < n {
        let msg = timeout(Duration::from_secs(10), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Core::Request(b) = msg {
            blocks.push(b);
        }
    }
    blocks.sort();
    blocks
}

#[tokio::test]
async fn choke_voids_outstanding_requests() {
    init_logs();

    let data = random_data(2 * PIECE_LEN);
    let (_, metainfo) = make_torrent("choked.bin", &data);
    let meta_info = MetaInfo::from_bytes(&metainfo).unwrap();
    let info_hash = meta_info.info_hash();

    let (listener, addr) = local_listener().await;

    let daemon = Daemon::new(config());
    let source = TorrentSource::MetaInfo(Box::new(meta_info));
    daemon.submit(source, StorageTarget::Memory, None).await.unwrap();
    daemon.start(&info_hash).await.unwrap();

    let session = daemon.session(&info_hash).await.unwrap();
    session.add_peer(addr, PeerSource::Tracker).await.unwrap();

    let socket = accept(&listener, &info_hash, info_hash.clone()).await;
    let mut socket = into_core(socket);

    let mut bitfield = Bitfield::from_piece(2);
    bitfield.fill(true);
    socket.send(Core::Bitfield(bitfield.clone())).await.unwrap();
    socket.send(Core::Unchoke).await.unwrap();

    let first = requests(&mut socket, 2).await;
    let content = session.ctx().content().unwrap();
    let pieces = &content.pieces;
    assert!(pieces.in_endgame());

    socket.send(Core::Choke).await.unwrap();

    timeout(Duration::from_secs(10), async {
        while pieces.in_endgame() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // nobody owns the blocks while we are choked
    let other = SocketAddr::from(([10, 0, 0, 1], 6881));
    let mut free: Vec<_> = (0..2)
        .filter_map(|_| pieces.claim_block(other, &bitfield))
        .collect();
    free.sort();
    assert_eq!(free, first);
    pieces.release_blocks(other);

    socket.send(Core::Unchoke).await.unwrap();
    let second = requests(&mut socket, 2).await;
    assert_eq!(second, first);

    for b in second {
        let start = b.index as usize * PIECE_LEN + b.begin as usize;
        let block = data[start..start + b.len as usize].to_vec();
        let block = Block { index: b.index, begin: b.begin, block };
        socket.send(Core::Piece(block)).await.unwrap();
    }

    timeout(Duration::from_secs(20), session.wait_complete())
        .await
        .unwrap()
        .unwrap();

    daemon.shutdown().await;
}
