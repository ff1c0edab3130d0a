use super::*;
use crate::bencode::{encode, FromBencode, Value};
use crate::constants::TRACKER_FAIL_WAIT;
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Serves every request with the same canned reply and reports each
/// request line.
async fn responder(status: &'static str, body: Vec<u8>) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let line = String::from_utf8_lossy(&head)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            let _ = tx.send(line);
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{}/announce", addr), rx)
}

fn compact_peers(count: u8) -> Vec<u8> {
    (1..=count)
        .flat_map(|n| [10, 1, 0, n, 0x1A, 0xE1])
        .collect()
}

fn announce_body(peers: u8) -> Vec<u8> {
    encode(&Value::dict([
        ("complete", Value::Integer(3)),
        ("incomplete", Value::Integer(27)),
        ("interval", Value::Integer(1800)),
        ("min interval", Value::Integer(60)),
        ("peers", Value::bytes(&compact_peers(peers))),
        ("tracker id", Value::string("xyz")),
    ]))
}

fn request(event: TrackerEvent) -> AnnounceRequest {
    AnnounceRequest {
        info_hash: [0xAB; 20],
        peer_id: *b"-SC0100-abcdefghijkl",
        port: 6881,
        uploaded: 10,
        downloaded: 20,
        left: 30,
        event,
        numwant: 50,
        ip: None,
    }
}

fn rerequester(tiers: Vec<Vec<String>>) -> Rerequester {
    Rerequester::new(
        tiers,
        Duration::from_secs(300),
        Duration::from_secs(5),
        Arc::new(Session::new()),
    )
    .unwrap()
}

#[test]
fn test_tracker_event() {
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_str(), "stopped");
    assert_eq!(TrackerEvent::Completed.as_str(), "completed");
    assert_eq!(TrackerEvent::None.as_str(), "");
}

#[test]
fn test_compact_peer_v4() {
    let bytes = [192, 168, 1, 1, 0x1A, 0xE1]; // 192.168.1.1:6881
    let peer = CompactPeer::from_v4_bytes(&bytes).unwrap();

    assert_eq!(peer.port, 6881);
    match peer.ip {
        std::net::IpAddr::V4(ip) => {
            assert_eq!(ip.octets(), [192, 168, 1, 1]);
        }
        _ => panic!("expected v4"),
    }
}

#[test]
fn test_parse_compact_peers() {
    let data = [
        192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
        10, 0, 0, // trailing garbage
    ];

    let peers = parse_compact_peers(&data);
    assert_eq!(peers.len(), 2);
}

#[test]
fn test_response_with_peer_dicts() {
    let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.74:porti7000eed2:ip4:nope4:porti1eeee";
    let response = AnnounceResponse::from_bencode_bytes(body).unwrap();
    assert_eq!(response.interval, 900);
    assert_eq!(response.peers, vec!["10.0.0.7:7000".parse::<SocketAddr>().unwrap()]);
    assert!(response.tracker_id.is_none());
}

#[test]
fn test_response_missing_interval() {
    assert!(AnnounceResponse::from_bencode_bytes(b"d5:peers0:e").is_err());
}

#[test]
fn test_scrape_response() {
    let mut hash = vec![b'2', b'0', b':'];
    hash.extend_from_slice(&[0xAB; 20]);
    let mut body = b"d5:filesd".to_vec();
    body.extend_from_slice(&hash);
    body.extend_from_slice(b"d8:completei5e10:downloadedi50e10:incompletei10eeee");

    let scrape = ScrapeResponse::from_bencode_bytes(&body).unwrap();
    let file = scrape.get(&[0xAB; 20]).unwrap();
    assert_eq!((file.complete, file.incomplete, file.downloaded), (5, 10, 50));
}

#[test]
fn test_scrape_url() {
    let timeout = Duration::from_secs(5);
    let tracker = HttpTracker::new("http://t.example/announce?x=1", timeout).unwrap();
    assert_eq!(tracker.scrape_url().as_deref(), Some("http://t.example/scrape?x=1"));
    let tracker = HttpTracker::new("http://t.example/a", timeout).unwrap();
    assert!(tracker.scrape_url().is_none());
}

#[test]
fn test_http_tracker_invalid_url() {
    let result = HttpTracker::new("ftp://tracker.example.com", Duration::from_secs(5));
    assert!(result.is_err());
}

#[test]
fn test_announce_url_fields() {
    let tracker = HttpTracker::new("http://t.example/announce", Duration::from_secs(5)).unwrap();
    let mut req = request(TrackerEvent::Started);
    req.ip = Some("1.2.3.4".into());
    let url = tracker.announce_url(&req, "0A1B2C3D", Some("xyz"));

    assert!(url.starts_with("http://t.example/announce?info_hash=%AB%AB"));
    for field in [
        "peer_id=-SC0100-abcdefghijkl",
        "port=6881",
        "uploaded=10",
        "downloaded=20",
        "left=30",
        "compact=1",
        "numwant=50",
        "key=0A1B2C3D",
        "event=started",
        "ip=1.2.3.4",
        "trackerid=xyz",
    ] {
        assert!(url.contains(field), "{} missing from {}", field, url);
    }

    let plain = tracker.announce_url(&request(TrackerEvent::None), "k", None);
    assert!(!plain.contains("event="));
    assert!(!plain.contains("trackerid="));
}

#[tokio::test]
async fn test_failure_reason_surfaces() {
    let (url, _requests) = responder("200 OK", b"d14:failure reason7:go awaye".to_vec()).await;
    let tracker = HttpTracker::new(&url, Duration::from_secs(5)).unwrap();
    let err = tracker
        .announce(&request(TrackerEvent::Started), "k", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::TrackerError(ref reason) if reason == "go away"));
}

#[tokio::test]
async fn test_failover_promotes_working_tracker() {
    let (t1, mut t1_requests) = responder("500 Internal Server Error", Vec::new()).await;
    let (t2, mut t2_requests) = responder("200 OK", announce_body(30)).await;
    let mut rr = rerequester(vec![vec![t1.clone(), t2.clone()]]);

    let outcome = rr.announce(request(TrackerEvent::Started)).unwrap().await;
    let announced = rr.finished(outcome, Instant::now()).unwrap();

    assert_eq!(announced.url, t2);
    assert_eq!(announced.peers.len(), 30);
    let mut sorted = announced.peers.clone();
    sorted.sort();
    let mut expected = parse_compact_peers(&compact_peers(30));
    expected.sort();
    assert_eq!(sorted, expected);
    assert_eq!(announced.complete, Some(3));
    assert_eq!(rr.tiers()[0][0], t2);
    assert_eq!(rr.next_delay(), Duration::from_secs(1800));

    let first = t2_requests.recv().await.unwrap();
    assert!(first.contains("event=started"));
    while t1_requests.try_recv().is_ok() {}

    // the next announce goes to T2 first and echoes its tracker id
    let outcome = rr.announce(request(TrackerEvent::None)).unwrap().await;
    rr.finished(outcome, Instant::now()).unwrap();
    let second = t2_requests.recv().await.unwrap();
    assert!(second.contains("trackerid=xyz"));
    assert!(t1_requests.try_recv().is_err());
}

#[tokio::test]
async fn test_all_trackers_failing() {
    let (t1, _r1) = responder("500 Internal Server Error", Vec::new()).await;
    let (t2, _r2) = responder("404 Not Found", Vec::new()).await;
    let mut rr = rerequester(vec![vec![t1], vec![t2]]);

    let outcome = rr.announce(request(TrackerEvent::Started)).unwrap().await;
    assert_eq!(outcome.failures.len(), 2);
    assert!(matches!(
        rr.finished(outcome, Instant::now()),
        Err(TrackerError::AllFailed)
    ));
    assert_eq!(rr.next_delay(), TRACKER_FAIL_WAIT);
    assert!(!rr.contacted_within(Instant::now(), Duration::from_secs(300)));
}

#[tokio::test]
async fn test_failure_after_success_waits_min_interval() {
    let (good, _r) = responder("200 OK", announce_body(2)).await;
    let mut rr = rerequester(vec![vec![good]]);
    let outcome = rr.announce(request(TrackerEvent::Started)).unwrap().await;
    let now = Instant::now();
    rr.finished(outcome, now).unwrap();
    assert!(rr.contacted_within(now, Duration::from_secs(300)));

    let failed = AnnounceOutcome {
        success: None,
        failures: vec![("http://x/announce".into(), TrackerError::Timeout)],
    };
    assert!(rr.finished(failed, now).is_err());
    assert_eq!(rr.next_delay(), Duration::from_secs(60));
}

#[tokio::test]
async fn test_single_announce_in_flight() {
    let mut rr = rerequester(vec![vec!["http://127.0.0.1:1/announce".into()]]);
    let first = rr.announce(request(TrackerEvent::Started));
    assert!(first.is_some());
    assert!(rr.in_flight());
    assert!(rr.announce(request(TrackerEvent::None)).is_none());

    let outcome = first.unwrap().await;
    assert!(rr.finished(outcome, Instant::now()).is_err());
    assert!(!rr.in_flight());
    assert!(rr.announce(request(TrackerEvent::None)).is_some());
}
