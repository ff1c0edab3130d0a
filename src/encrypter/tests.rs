use super::*;
use crate::connecter::ConnecterOptions;
use crate::peer::{Message, HANDSHAKE_LEN};
use crate::rawserver::Outgoing;
use std::net::IpAddr;

const INFO_HASH: [u8; 20] = [7; 20];

fn options() -> EncrypterOptions {
    EncrypterOptions {
        max_initiate: 3,
        max_connections: 4,
        handshake_timeout: Duration::from_secs(15),
        security: false,
    }
}

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::from([10, 0, 0, last]), 6881)
}

fn encrypter(options: EncrypterOptions, session: Arc<Session>) -> Encrypter {
    Encrypter::new(options, INFO_HASH, PeerId([1; 20]), session)
}

fn connecter() -> Connecter {
    Connecter::new(ConnecterOptions {
        piece_count: 8,
        listen_port: 6881,
        pex_max: 0,
        overlay_support: false,
    })
}

fn remote(peer: u8) -> Bytes {
    Handshake::new(INFO_HASH, [peer; 20]).encode()
}

#[test]
fn test_handshake_parsed_incrementally() {
    let now = Instant::now();
    let mut pending = PendingHandshake::new(addr(1), false, None, now);
    let mut wire = remote(2).to_vec();
    wire.extend_from_slice(&Message::Interested.encode());

    assert!(pending.feed(&wire[..1], &INFO_HASH).unwrap().is_none());
    assert!(pending.feed(&wire[1..40], &INFO_HASH).unwrap().is_none());
    let completed = pending.feed(&wire[40..], &INFO_HASH).unwrap().unwrap();
    assert_eq!(completed.handshake.peer_id, [2; 20]);
    assert!(completed.handshake.supports_extension_protocol());
    assert_eq!(&completed.rest[..], &Message::Interested.encode()[..]);
}

#[test]
fn test_bad_prefix_fails_early() {
    let now = Instant::now();
    let mut pending = PendingHandshake::new(addr(1), false, None, now);
    assert!(matches!(
        pending.feed(&[18], &INFO_HASH),
        Err(PeerError::InvalidHandshake)
    ));

    let mut pending = PendingHandshake::new(addr(1), false, None, now);
    let mut wire = remote(2).to_vec();
    wire[5] = b'X';
    assert!(pending.feed(&wire[..20], &INFO_HASH).is_err());

    // info hash is checked before the peer id arrives
    let mut pending = PendingHandshake::new(addr(1), false, None, now);
    let other = Handshake::new([9; 20], [2; 20]).encode();
    assert!(matches!(
        pending.feed(&other[..48], &INFO_HASH),
        Err(PeerError::InfoHashMismatch)
    ));
}

#[test]
fn test_accepted_socket_is_admitted() {
    let now = Instant::now();
    let mut enc = encrypter(options(), Arc::new(Session::new()));
    let reply = enc.accepted(SocketId(1), addr(5), 0, now).unwrap();
    assert_eq!(reply.len(), HANDSHAKE_LEN);
    assert_eq!(&reply[28..48], &INFO_HASH);

    let admitted = enc
        .receive(SocketId(1), &remote(5), &connecter())
        .unwrap()
        .unwrap();
    assert_eq!(admitted.addr, addr(5));
    assert_eq!(admitted.peer_id, PeerId([5; 20]));
    assert!(!admitted.locally_initiated);
    assert!(admitted.supports_extensions);
    assert!(admitted.rest.is_empty());
    assert_eq!(enc.pending_count(), 0);
}

#[test]
fn test_banned_and_over_limit_refused() {
    let now = Instant::now();
    let session = Arc::new(Session::new());
    session.ban(addr(9).ip());
    let mut enc = encrypter(options(), Arc::clone(&session));

    assert!(enc.accepted(SocketId(1), addr(9), 0, now).is_none());
    assert!(enc.accepted(SocketId(2), addr(2), 4, now).is_none());
    assert!(enc.accepted(SocketId(3), addr(3), 3, now).is_some());

    enc.enqueue([addr(9), addr(4)]);
    assert_eq!(enc.queued_count(), 1);
}

#[test]
fn test_self_and_duplicate_connections_rejected() {
    let now = Instant::now();
    let mut enc = encrypter(options(), Arc::new(Session::new()));

    enc.accepted(SocketId(1), addr(1), 0, now).unwrap();
    let ours = Handshake::new(INFO_HASH, [1; 20]).encode();
    assert!(enc.receive(SocketId(1), &ours, &connecter()).is_err());

    let mut established = connecter();
    established.connection_made(SocketId(7), addr(2), PeerId([2; 20]), true, false, now, &mut Outgoing::new());

    enc.accepted(SocketId(2), addr(3), 1, now).unwrap();
    assert!(enc.receive(SocketId(2), &remote(2), &established).is_err());

    // same IP, different peer id: only rejected with security on
    let mut secure = encrypter(
        EncrypterOptions {
            security: true,
            ..options()
        },
        Arc::new(Session::new()),
    );
    secure.accepted(SocketId(3), addr(2), 1, now).unwrap();
    assert!(secure.receive(SocketId(3), &remote(4), &established).is_err());

    enc.accepted(SocketId(4), addr(2), 1, now).unwrap();
    assert!(enc.receive(SocketId(4), &remote(4), &established).unwrap().is_some());
}

#[test]
fn test_connects_respect_initiate_cap() {
    let now = Instant::now();
    let mut enc = encrypter(options(), Arc::new(Session::new()));
    enc.enqueue((1..=5).map(addr));
    enc.enqueue([addr(1)]);
    assert_eq!(enc.queued_count(), 5);

    let connects = enc.next_connects(1);
    assert_eq!(connects.start.len(), 2);
    assert!(!connects.deferred);
    assert_eq!(enc.connecting_count(), 2);

    // a connect turning into a pending handshake still counts
    let (first, permit) = connects.start.into_iter().next().unwrap();
    enc.connected(SocketId(1), first, Some(permit), now);
    assert!(enc.next_connects(1).start.is_empty());

    enc.connect_failed(addr(2));
    assert_eq!(enc.next_connects(1).start.len(), 1);
}

#[test]
fn test_connects_deferred_when_session_quota_full() {
    let session = Arc::new(Session::with_connect_limit(1));
    let held = session.try_connect().unwrap();
    let mut enc = encrypter(options(), Arc::clone(&session));
    enc.enqueue([addr(1), addr(2)]);

    let connects = enc.next_connects(0);
    assert!(connects.start.is_empty());
    assert!(connects.deferred);
    assert_eq!(enc.queued_count(), 2);

    drop(held);
    let connects = enc.next_connects(0);
    assert_eq!(connects.start.len(), 1);
    assert!(connects.deferred);
}

#[test]
fn test_permit_released_with_handshake() {
    let now = Instant::now();
    let session = Arc::new(Session::with_connect_limit(2));
    let mut enc = encrypter(options(), Arc::clone(&session));
    enc.enqueue([addr(2)]);
    let (target, permit) = enc.next_connects(0).start.pop().unwrap();
    enc.connected(SocketId(1), target, Some(permit), now);
    assert_eq!(session.connects_in_flight(), 1);

    enc.receive(SocketId(1), &remote(2), &connecter()).unwrap().unwrap();
    assert_eq!(session.connects_in_flight(), 0);
}

#[test]
fn test_slow_handshakes_expire() {
    let start = Instant::now();
    let mut enc = encrypter(options(), Arc::new(Session::new()));
    enc.accepted(SocketId(1), addr(1), 0, start).unwrap();
    enc.accepted(SocketId(2), addr(2), 0, start + Duration::from_secs(10)).unwrap();

    assert!(enc.expire(start + Duration::from_secs(14)).is_empty());
    assert_eq!(enc.expire(start + Duration::from_secs(15)), vec![SocketId(1)]);
    assert_eq!(enc.pending_count(), 1);
    assert!(enc.closed(SocketId(2)));
    assert!(!enc.closed(SocketId(2)));
}

#[test]
fn test_reannounce_delay_in_window() {
    for _ in 0..20 {
        let delay = reannounce_delay();
        assert!(delay >= Duration::from_secs(60) && delay <= Duration::from_secs(300));
    }
}
