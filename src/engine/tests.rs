use super::*;
use crate::bencode::{encode, Value};
use crate::peer::{Handshake, HANDSHAKE_LEN};
use sha1::{Digest, Sha1};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PIECE: usize = 64 * 1024;
const PIECES: usize = 10;
const NAME: &str = "payload.bin";

fn content() -> Vec<u8> {
    (0..PIECE * PIECES)
        .map(|i| ((i * 31 + i / 4093) % 256) as u8)
        .collect()
}

fn torrent(data: &[u8], announce: Option<&str>) -> Metainfo {
    let pieces: Vec<u8> = data
        .chunks(PIECE)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect();
    let info = Value::dict([
        ("length", Value::Integer(data.len() as i64)),
        ("name", Value::string(NAME)),
        ("piece length", Value::Integer(PIECE as i64)),
        ("pieces", Value::bytes(&pieces)),
    ]);
    let mut entries = vec![("info", info)];
    if let Some(url) = announce {
        entries.push(("announce", Value::string(url)));
    }
    Metainfo::from_bytes(&encode(&Value::dict(entries))).unwrap()
}

fn config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], addr.port()))
}

async fn start(
    metainfo: &Metainfo,
    dir: &Path,
) -> (EngineHandle, JoinHandle<Result<(), EngineError>>) {
    let (engine, handle) = Engine::new(metainfo, dir, config(), Arc::new(Session::new()))
        .await
        .unwrap();
    (handle, tokio::spawn(engine.run()))
}

/// Answers every announce with an empty peer list and reports each
/// request line.
async fn tracker() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let body = b"d8:intervali1800e5:peers0:e";
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let line = String::from_utf8_lossy(&head)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            let _ = tx.send(line);
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.write_all(body).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{}/announce", addr), rx)
}

/// Reads one length-prefixed message, returning its id (`None` for a
/// keep-alive) and payload.
async fn read_message(stream: &mut TcpStream) -> (Option<u8>, Vec<u8>) {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 {
        return (None, Vec::new());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (Some(body[0]), body[1..].to_vec())
}

#[tokio::test]
async fn test_leecher_downloads_from_seed() {
    init_tracing();
    let data = content();
    let metainfo = torrent(&data, None);
    let seed_dir = TempDir::new().unwrap();
    std::fs::write(seed_dir.path().join(NAME), &data).unwrap();
    let leech_dir = TempDir::new().unwrap();

    let (seed, seed_task) = start(&metainfo, seed_dir.path()).await;
    let (mut leech, leech_task) = start(&metainfo, leech_dir.path()).await;
    assert!(seed.status().seeding);
    assert_eq!(leech.status().left, data.len() as u64);

    leech.add_peers(vec![loopback(seed.listen_addr())]).unwrap();
    let done = tokio::time::timeout(Duration::from_secs(60), leech.wait_for(|s| s.seeding))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.have, PIECES);
    assert_eq!(done.left, 0);
    assert!(done.downloaded >= data.len() as u64);

    leech.stop().unwrap();
    seed.stop().unwrap();
    leech_task.await.unwrap().unwrap();
    seed_task.await.unwrap().unwrap();

    assert!(seed.status().uploaded >= data.len() as u64);
    assert!(!leech.status().running);
    assert_eq!(std::fs::read(leech_dir.path().join(NAME)).unwrap(), data);
}

#[tokio::test]
async fn test_resume_snapshot_is_used_on_restart() {
    let data = content();
    let metainfo = torrent(&data, None);
    let dir = TempDir::new().unwrap();
    let mut partial = data.clone();
    partial[7 * PIECE..].fill(0);
    std::fs::write(dir.path().join(NAME), &partial).unwrap();

    let (engine, handle) = Engine::new(&metainfo, dir.path(), config(), Arc::new(Session::new()))
        .await
        .unwrap();
    let snapshot = engine.snapshot_path().to_path_buf();
    assert_eq!(handle.status().have, 7);
    assert_eq!(handle.status().left, 3 * PIECE as u64);

    let task = tokio::spawn(engine.run());
    handle.stop().unwrap();
    task.await.unwrap().unwrap();
    assert!(snapshot.exists());

    // verified pieces come from the snapshot, not from hashing the file
    partial[..PIECE].fill(0xFF);
    std::fs::write(dir.path().join(NAME), &partial).unwrap();
    let (_engine, handle) = Engine::new(&metainfo, dir.path(), config(), Arc::new(Session::new()))
        .await
        .unwrap();
    assert_eq!(handle.status().have, 7);
    assert_eq!(handle.status().left, 3 * PIECE as u64);
}

#[tokio::test]
async fn test_stop_announces_stopped() {
    let (url, mut requests) = tracker().await;
    let data = content();
    let metainfo = torrent(&data, Some(&url));
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&metainfo, dir.path()).await;

    let started = tokio::time::timeout(Duration::from_secs(10), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(started.contains("event=started"), "{}", started);
    assert!(started.contains(&format!("left={}", data.len())), "{}", started);
    assert!(started.contains("compact=1"));

    handle.stop().unwrap();
    task.await.unwrap().unwrap();
    let mut lines = Vec::new();
    while let Ok(line) = requests.try_recv() {
        lines.push(line);
    }
    assert!(
        lines.iter().any(|line| line.contains("event=stopped")),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn test_raw_peer_handshake_and_violation() {
    init_tracing();
    let data = content();
    let metainfo = torrent(&data, None);
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(NAME), &data).unwrap();
    let (handle, task) = start(&metainfo, dir.path()).await;

    let mut stream = TcpStream::connect(loopback(handle.listen_addr())).await.unwrap();
    let ours = Handshake::new(metainfo.info_hash.0, [0x42; 20]);
    stream.write_all(&ours.encode()).await.unwrap();

    let mut reply = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut reply).await.unwrap();
    let theirs = Handshake::decode(&reply).unwrap();
    assert_eq!(theirs.info_hash, metainfo.info_hash.0);
    assert_eq!(theirs.peer_id, handle.peer_id().0);

    // bitfield first, the masked pieces as HAVEs, then the extension handshake
    let (id, bitfield) = read_message(&mut stream).await;
    assert_eq!(id, Some(5));
    assert_eq!(bitfield.len(), PIECES.div_ceil(8));
    let mut haves = 0;
    loop {
        match read_message(&mut stream).await {
            (Some(4), _) => haves += 1,
            (Some(20), _) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    let shown: u32 = bitfield.iter().map(|b| b.count_ones()).sum();
    assert_eq!(shown as usize + haves, PIECES);

    // HAVE for a piece that does not exist
    let mut have = vec![0, 0, 0, 5, 4];
    have.extend_from_slice(&999u32.to_be_bytes());
    stream.write_all(&have).await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();

    handle.stop().unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_info_hash_is_refused() {
    let data = content();
    let metainfo = torrent(&data, None);
    let dir = TempDir::new().unwrap();
    let (handle, task) = start(&metainfo, dir.path()).await;

    let mut stream = TcpStream::connect(loopback(handle.listen_addr())).await.unwrap();
    stream
        .write_all(&Handshake::new([9; 20], [0x42; 20]).encode())
        .await
        .unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert!(received.len() <= HANDSHAKE_LEN);
    assert_eq!(handle.status().peers, 0);

    handle.stop().unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handle_after_shutdown() {
    let data = content();
    let metainfo = torrent(&data, None);
    let dir = TempDir::new().unwrap();
    let (mut handle, task) = start(&metainfo, dir.path()).await;

    handle.stop().unwrap();
    task.await.unwrap().unwrap();
    let status = handle.wait_for(|s| !s.running).await.unwrap();
    assert_eq!(status.peers, 0);
    assert!(matches!(
        handle.add_peers(vec!["127.0.0.1:1".parse().unwrap()]),
        Err(EngineError::Stopped)
    ));
}

#[tokio::test]
async fn test_stream_window_from_config() {
    let data = content();
    let metainfo = torrent(&data, None);
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.set("stream_window", "4").unwrap();

    let (engine, _handle) = Engine::new(&metainfo, dir.path(), config, Arc::new(Session::new()))
        .await
        .unwrap();
    assert!(engine.picker.is_streaming());
    assert_eq!(engine.picker.stream_window(), 4);
}
