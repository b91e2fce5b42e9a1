//! End-to-end transfers between two nodes over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::{
    Event, EventKind, Keypair, TransferId, TransferMetadata, TransferStatus, PROTOCOL_ID,
};
use sluice_node::{downloads, logging, Dialer, Node, OutgoingFile, PeerAddr, TransferProtocol};
use tokio::sync::mpsc;

struct Peer {
    node: Node,
    protocol: TransferProtocol,
    events: mpsc::UnboundedReceiver<Event>,
}

async fn listening_peer() -> (Peer, SocketAddr) {
    logging::init_for_tests();
    let node = Node::new(Arc::new(Keypair::generate())).with_max_frame_len(1024 * 1024);
    let protocol = TransferProtocol::new();
    let events = record_events(&protocol);
    protocol.register_handler(&node);
    let addr = node.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (
        Peer {
            node,
            protocol,
            events,
        },
        addr,
    )
}

fn dialing_peer() -> Peer {
    let node = Node::new(Arc::new(Keypair::generate()));
    let protocol = TransferProtocol::new();
    let events = record_events(&protocol);
    Peer {
        node,
        protocol,
        events,
    }
}

fn record_events(protocol: &TransferProtocol) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in EventKind::ALL {
        let tx = tx.clone();
        protocol.subscribe(kind, move |e| {
            tx.send(e.clone())?;
            Ok(())
        });
    }
    rx
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_offer(events: &mut mpsc::UnboundedReceiver<Event>) -> TransferId {
    match next_event(events).await {
        Event::IncomingOffer(o) => o.id,
        other => panic!("expected incoming-offer, got {}", other.kind()),
    }
}

fn hello_file() -> OutgoingFile {
    OutgoingFile::from_bytes("a.txt", "text/plain", b"hello world".to_vec())
}

#[tokio::test]
async fn accepted_single_chunk_is_delivered() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move { protocol.send(&node, addr, hello_file(), 64 * 1024, |_, _| {}).await }
    });

    let id = next_offer(&mut receiver.events).await;
    assert!(receiver.protocol.accept(id).await);
    assert_eq!(next_event(&mut receiver.events).await.kind(), EventKind::IncomingAccepted);

    let mut progress = Vec::new();
    let complete = loop {
        match next_event(&mut receiver.events).await {
            Event::IncomingProgress(p) => progress.push(p.received_bytes),
            Event::IncomingComplete(c) => break c,
            other => panic!("unexpected {}", other.kind()),
        }
    };
    assert_eq!(progress, vec![11]);
    assert_eq!(complete.payload, b"hello world");
    assert_eq!(complete.name, "a.txt");
    assert_eq!(complete.mime_type, "text/plain");
    assert_eq!(complete.from_peer, sender.node.peer_id());

    let report = send.await.unwrap().unwrap();
    assert!(report.accepted);
    assert_eq!(report.bytes_sent, 11);

    let record = receiver.protocol.record(id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Done);
    assert_eq!(record.received_bytes, 11);
}

#[tokio::test]
async fn rejected_offer_moves_no_payload() {
    let (mut receiver, addr) = listening_peer().await;
    let mut sender = dialing_peer();

    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move { protocol.send(&node, addr, hello_file(), 4, |_, _| {}).await }
    });

    let id = next_offer(&mut receiver.events).await;
    assert!(receiver.protocol.reject(id).await);

    let report = send.await.unwrap().unwrap();
    assert!(!report.accepted);
    assert_eq!(report.bytes_sent, 0);
    match next_event(&mut sender.events).await {
        Event::SendRejected(e) => {
            assert_eq!(e.name, "a.txt");
            assert_eq!(e.peer, receiver.node.peer_id());
        }
        other => panic!("expected send-rejected, got {}", other.kind()),
    }

    assert_eq!(next_event(&mut receiver.events).await.kind(), EventKind::IncomingRejected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(receiver.events.try_recv().is_err());
    assert_eq!(
        receiver.protocol.record(id).await.unwrap().status,
        TransferStatus::Rejected
    );
}

#[tokio::test]
async fn chunked_send_reports_progress_in_order() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move {
            let mut sent = Vec::new();
            let report = protocol
                .send(&node, addr, hello_file(), 4, |n, _| sent.push(n))
                .await;
            (report, sent)
        }
    });

    let id = next_offer(&mut receiver.events).await;
    receiver.protocol.accept(id).await;
    next_event(&mut receiver.events).await;

    let mut progress = Vec::new();
    let complete = loop {
        match next_event(&mut receiver.events).await {
            Event::IncomingProgress(p) => {
                assert_eq!(p.id, id);
                assert_eq!(p.total_bytes, 11);
                assert!(p.rate_mbps >= 0.0);
                progress.push(p.received_bytes);
            }
            Event::IncomingComplete(c) => break c,
            other => panic!("unexpected {}", other.kind()),
        }
    };
    assert_eq!(progress, vec![4, 8, 11]);
    assert_eq!(complete.payload, b"hello world");

    let (report, sent) = send.await.unwrap();
    assert_eq!(report.unwrap().bytes_sent, 11);
    assert_eq!(sent, vec![4, 8, 11]);
}

#[tokio::test]
async fn malformed_metadata_never_becomes_an_offer() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    let mut stream = sender.node.open_stream(addr, PROTOCOL_ID).await.unwrap();
    stream.write_frame(b"not json").await.unwrap();
    assert!(stream.read_frame().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(receiver.events.try_recv().is_err());
    assert!(receiver.protocol.records().await.is_empty());
}

#[tokio::test]
async fn concurrent_offers_are_isolated() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    // Two raw streams so the test controls when each side writes.
    let meta = TransferMetadata::new("a.txt", 8, "text/plain").to_payload().unwrap();
    let mut first = sender.node.open_stream(addr, PROTOCOL_ID).await.unwrap();
    first.write_frame(&meta).await.unwrap();
    let a = next_offer(&mut receiver.events).await;
    let mut second = sender.node.open_stream(addr, PROTOCOL_ID).await.unwrap();
    second.write_frame(&meta).await.unwrap();
    let b = next_offer(&mut receiver.events).await;
    assert_ne!(a, b);

    receiver.protocol.accept(a).await;
    assert_eq!(first.read_frame().await.unwrap().unwrap(), vec![1]);
    first.write_frame(&[7; 4]).await.unwrap();
    loop {
        if let Event::IncomingProgress(p) = next_event(&mut receiver.events).await {
            assert_eq!(p.id, a);
            break;
        }
    }

    let other = receiver.protocol.record(b).await.unwrap();
    assert_eq!(other.status, TransferStatus::Offer);
    assert_eq!(other.received_bytes, 0);
    assert_eq!(receiver.protocol.record(a).await.unwrap().received_bytes, 4);
    assert_eq!(receiver.protocol.pending().await, vec![b]);

    receiver.protocol.reject(b).await;
    assert_eq!(second.read_frame().await.unwrap().unwrap(), vec![0]);
}

#[tokio::test]
async fn oversized_frame_fails_the_transfer() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    let big = OutgoingFile::from_bytes("big.bin", "application/octet-stream", vec![0u8; 2 * 1024 * 1024]);
    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move { protocol.send(&node, addr, big, 2 * 1024 * 1024, |_, _| {}).await }
    });

    let id = next_offer(&mut receiver.events).await;
    receiver.protocol.accept(id).await;
    let failed = loop {
        match next_event(&mut receiver.events).await {
            Event::IncomingError(e) => break e,
            Event::IncomingAccepted(_) => {}
            other => panic!("unexpected {}", other.kind()),
        }
    };
    assert_eq!(failed.id, id);
    assert_eq!(receiver.protocol.record(id).await.unwrap().status, TransferStatus::Error);
    let _ = send.await.unwrap();
}

#[tokio::test]
async fn file_from_disk_reaches_the_pinned_peer() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    tokio::fs::write(&path, br#"{"ok":true}"#).await.unwrap();

    let target = PeerAddr::new(addr).expecting(receiver.node.peer_id());
    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move {
            let file = OutgoingFile::open(&path).await.unwrap();
            protocol.send(&node, target, file, 4, |_, _| {}).await
        }
    });

    let id = next_offer(&mut receiver.events).await;
    receiver.protocol.accept(id).await;
    let complete = loop {
        if let Event::IncomingComplete(c) = next_event(&mut receiver.events).await {
            break c;
        }
    };
    assert_eq!(complete.name, "report.json");
    assert_eq!(complete.mime_type, "application/json");
    assert_eq!(complete.payload, br#"{"ok":true}"#);
    assert!(send.await.unwrap().unwrap().accepted);
}

#[tokio::test]
async fn failed_save_still_evicts_the_record() {
    let (mut receiver, addr) = listening_peer().await;
    let sender = dialing_peer();

    let send = tokio::spawn({
        let protocol = sender.protocol.clone();
        let node = sender.node.clone();
        async move { protocol.send(&node, addr, hello_file(), 64, |_, _| {}).await }
    });

    let id = next_offer(&mut receiver.events).await;
    receiver.protocol.accept(id).await;
    let complete = loop {
        if let Event::IncomingComplete(c) = next_event(&mut receiver.events).await {
            break c;
        }
    };
    send.await.unwrap().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let not_a_dir = dir.path().join("occupied");
    tokio::fs::write(&not_a_dir, b"").await.unwrap();
    assert!(downloads::store(&receiver.protocol, &not_a_dir, &complete).await.is_none());
    assert!(receiver.protocol.record(id).await.is_none());
}
