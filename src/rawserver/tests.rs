use super::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[test]
fn test_task_queue_order_and_cancel() {
    let mut queue = TaskQueue::new();
    let now = Instant::now();
    queue.schedule(now + Duration::from_secs(3), "c");
    let b = queue.schedule(now + Duration::from_secs(2), "b");
    queue.schedule(now + Duration::from_secs(1), "a");
    queue.schedule(now + Duration::from_secs(1), "a2");

    assert_eq!(queue.len(), 4);
    assert!(queue.cancel(b));
    assert!(!queue.cancel(b));
    assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));

    assert_eq!(queue.pop_due(now), None);
    let later = now + Duration::from_secs(5);
    assert_eq!(queue.pop_due(later), Some("a"));
    assert_eq!(queue.pop_due(later), Some("a2"));
    assert_eq!(queue.pop_due(later), Some("c"));
    assert_eq!(queue.pop_due(later), None);
    assert!(queue.is_empty());
}

#[test]
fn test_cancel_after_run() {
    let mut queue = TaskQueue::new();
    let now = Instant::now();
    let id = queue.schedule(now, 1);
    assert_eq!(queue.pop_due(now), Some(1));
    assert!(!queue.cancel(id));
}

#[tokio::test]
async fn test_scheduled_task_fires() {
    let mut server: RawServer<u32> = RawServer::new();
    let cancelled = server.schedule(Duration::from_millis(10), 1);
    server.schedule(Duration::from_millis(20), 2);
    server.cancel(cancelled);

    match tokio::time::timeout(Duration::from_secs(2), server.next_event()).await {
        Ok(RawEvent::Task(task)) => assert_eq!(task, 2),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_accept_data_and_close() {
    let mut server: RawServer<()> = RawServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let id = match server.next_event().await {
        RawEvent::Accepted { id, .. } => id,
        other => panic!("expected accept, got {:?}", other),
    };

    client.write_all(b"hello").await.unwrap();
    let mut received = Vec::new();
    while received.len() < 5 {
        match server.next_event().await {
            RawEvent::Data { id: from, data } => {
                assert_eq!(from, id);
                received.extend_from_slice(&data);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }
    assert_eq!(received, b"hello");

    assert!(server.send(id, Bytes::from_static(b"world")));
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    drop(client);
    loop {
        match server.next_event().await {
            RawEvent::Closed { id: closed, .. } => {
                assert_eq!(closed, id);
                break;
            }
            RawEvent::Flushed { .. } => {}
            other => panic!("expected close, got {:?}", other),
        }
    }
    assert_eq!(server.socket_count(), 0);
    assert!(!server.send(id, Bytes::from_static(b"x")));
}

#[tokio::test]
async fn test_connect_reports_result() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut server: RawServer<()> = RawServer::new();
    server.connect(addr, Duration::from_secs(5), None);
    let (accepted, event) = tokio::join!(listener.accept(), server.next_event());
    let mut remote = accepted.unwrap().0;
    let id = match event {
        RawEvent::Connected { id, addr: to, .. } => {
            assert_eq!(to, addr);
            id
        }
        other => panic!("expected connect, got {:?}", other),
    };
    assert_eq!(server.addr(id), Some(addr));

    server.send(id, Bytes::from_static(b"bye"));
    server.close(id);
    let mut buf = Vec::new();
    remote.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"bye");

    drop(listener);
    server.connect(addr, Duration::from_secs(5), None);
    assert!(matches!(
        server.next_event().await,
        RawEvent::ConnectFailed { .. }
    ));
}

#[tokio::test]
async fn test_shutdown_drains_writers() {
    let mut server: RawServer<()> = RawServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let id = match server.next_event().await {
        RawEvent::Accepted { id, .. } => id,
        other => panic!("expected accept, got {:?}", other),
    };
    server.send(id, Bytes::from(vec![7u8; 100_000]));
    server.shutdown(Duration::from_secs(5)).await;

    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf.len(), 100_000);
    assert!(server.local_addr().is_none());
}
