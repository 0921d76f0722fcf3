//! Two-client end-to-end scenarios over in-memory routes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;

use trellis_core::{CONTROL_ID, Id, TransferPath};
use trellis_crypto::ProvideMode;
use trellis_route::{Route, RouteManager, StaticTransport};
use trellis_transfer::{Client, ClientSettings, TransferError};
use trellis_wire::{
    Contract, ControlMessage, CreateContractResult, Frame, MessageType, PeerAudit, StoredContract,
    TransferFrame,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire a one-directional link: frames written toward `toward` on
/// `sender` become readable on `receiver`.
fn link(sender: &Arc<RouteManager>, receiver: &Arc<RouteManager>, toward: Id, name: &str) -> Route {
    let route = Route::new(64);
    let path = TransferPath::to_destination(toward);
    sender.update_transport(
        Arc::new(StaticTransport::new(format!("{name}-up"), path)),
        vec![route.clone()],
    );
    receiver.update_transport(
        Arc::new(StaticTransport::new(format!("{name}-down"), path)),
        vec![route.clone()],
    );
    route
}

/// Wire a link through a pump so tests can drop chosen frames.
fn lossy_link(
    sender: &Arc<RouteManager>,
    receiver: &Arc<RouteManager>,
    toward: Id,
    name: &str,
    mut drop_frame: impl FnMut(&[u8]) -> bool + Send + 'static,
) {
    let upstream = Route::new(64);
    let downstream = Route::new(64);
    let path = TransferPath::to_destination(toward);
    sender.update_transport(
        Arc::new(StaticTransport::new(format!("{name}-up"), path)),
        vec![upstream.clone()],
    );
    receiver.update_transport(
        Arc::new(StaticTransport::new(format!("{name}-down"), path)),
        vec![downstream.clone()],
    );
    tokio::spawn(async move {
        while let Some(frame) = upstream.recv().await {
            if drop_frame(&frame) {
                continue;
            }
            if downstream.send_timeout(frame, Duration::from_secs(5)).await.is_err() {
                return;
            }
        }
    });
}

fn payload(text: String) -> Vec<Frame> {
    vec![Frame::new(MessageType::TransferPack, Bytes::from(text))]
}

fn payload_text(frames: &[Frame]) -> String {
    String::from_utf8_lossy(&frames[0].message_bytes).into_owned()
}

fn exempt_pair(a: &Client, b: &Client) {
    a.contract_manager().add_send_no_contract_peer(b.client_id());
    a.contract_manager()
        .add_receive_no_contract_peer(b.client_id());
    b.contract_manager().add_send_no_contract_peer(a.client_id());
    b.contract_manager()
        .add_receive_no_contract_peer(a.client_id());
}

async fn wait_for(counter: &AtomicUsize, target: usize) {
    timeout(TEST_TIMEOUT, async {
        while counter.load(Ordering::SeqCst) < target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {target}, reached {}",
            counter.load(Ordering::SeqCst)
        )
    });
}

#[tokio::test]
async fn test_reliable_delivery_and_restart() {
    const N: usize = 10;
    let a_id = Id::new();
    let b_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());
    let b_routes = Arc::new(RouteManager::new());
    link(&a_routes, &b_routes, b_id, "ab");
    link(&b_routes, &a_routes, a_id, "ba");

    let a = Client::new(a_id, a_routes.clone(), ClientSettings::default());
    let b = Client::new(b_id, b_routes.clone(), ClientSettings::default());
    exempt_pair(&a, &b);

    let received = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        let order = order.clone();
        b.add_receive_callback(move |event| {
            order.lock().push(payload_text(&event.frames));
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    let acked = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let acked = acked.clone();
        a.send_with_callback(
            trellis_transfer::SendKey::to_destination(b_id),
            payload(format!("first-{i}")),
            Some(Box::new(move |result| {
                result.unwrap();
                acked.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    }
    wait_for(&acked, N).await;
    wait_for(&received, N).await;

    // Destroy A; a new instance with the same client id but a fresh
    // instance id resumes cleanly. The receiver sees a new sequence.
    a.close();
    let a2 = Client::new(a_id, a_routes, ClientSettings::default());
    assert_ne!(a.instance_id(), a2.instance_id());
    exempt_pair(&a2, &b);

    let acked2 = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let acked2 = acked2.clone();
        a2.send_with_callback(
            trellis_transfer::SendKey::to_destination(b_id),
            payload(format!("second-{i}")),
            Some(Box::new(move |result| {
                result.unwrap();
                acked2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    }
    wait_for(&acked2, N).await;
    wait_for(&received, 2 * N).await;

    // In-order within each burst, no leakage across the boundary.
    let order = order.lock();
    for i in 0..N {
        assert_eq!(order[i], format!("first-{i}"));
        assert_eq!(order[N + i], format!("second-{i}"));
    }
}

#[tokio::test]
async fn test_lossy_route_recovers_in_order() {
    const N: usize = 10;
    let a_id = Id::new();
    let b_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());
    let b_routes = Arc::new(RouteManager::new());

    // Drop the first transfer pack with sequence number 2: the receiver
    // must hold 3.. in its reorder queue until the retransmit arrives.
    let mut dropped = false;
    lossy_link(&a_routes, &b_routes, b_id, "ab", move |bytes| {
        if dropped {
            return false;
        }
        let Ok(frame) = TransferFrame::decode(bytes) else {
            return false;
        };
        if frame.frame.message_type != MessageType::TransferPack {
            return false;
        }
        let Ok(pack) = trellis_wire::Pack::decode(&frame.frame.message_bytes) else {
            return false;
        };
        if pack.sequence_number == 2 {
            dropped = true;
            return true;
        }
        false
    });
    link(&b_routes, &a_routes, a_id, "ba");

    let mut settings = ClientSettings::default();
    settings.resend_interval = Duration::from_millis(100);
    let a = Client::new(a_id, a_routes, settings.clone());
    let b = Client::new(b_id, b_routes, settings);
    exempt_pair(&a, &b);

    let received = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        let order = order.clone();
        b.add_receive_callback(move |event| {
            order.lock().push(payload_text(&event.frames));
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    let acked = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let acked = acked.clone();
        a.send_with_callback(
            trellis_transfer::SendKey::to_destination(b_id),
            payload(format!("msg-{i}")),
            Some(Box::new(move |result| {
                result.unwrap();
                acked.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    }

    wait_for(&acked, N).await;
    wait_for(&received, N).await;

    let order = order.lock();
    let expect: Vec<String> = (0..N).map(|i| format!("msg-{i}")).collect();
    assert_eq!(*order, expect);
}

#[tokio::test]
async fn test_contract_metered_delivery_with_renewal() {
    const N: usize = 4;
    let a_id = Id::new();
    let b_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());
    let b_routes = Arc::new(RouteManager::new());
    link(&a_routes, &b_routes, b_id, "ab");
    link(&b_routes, &a_routes, a_id, "ba");

    let mut settings = ClientSettings::default();
    settings.min_message_byte_count = 64;
    settings.contract_fill_fraction = 1.0;
    let a = Client::new(a_id, a_routes, settings.clone());
    let b = Client::new(b_id, b_routes, settings);

    // B provides; A gets platform-style contracts signed by B's key.
    // Each contract covers two minimum charges, forcing a renewal.
    b.set_provide_modes(&[ProvideMode::Network]);
    for _ in 0..2 {
        let stored = StoredContract {
            contract_id: Id::new(),
            transfer_byte_count: 128,
            source_id: a_id,
            destination_id: b_id,
            stream_id: Id::NIL,
        };
        let contract = b
            .contract_manager()
            .seal_contract(&stored, ProvideMode::Network)
            .unwrap();
        assert!(a
            .contract_manager()
            .receive_create_contract_result(CreateContractResult {
                contract: Some(contract),
                error: None,
            }));
    }

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        b.add_receive_callback(move |event| {
            assert_eq!(event.provide_mode, ProvideMode::Network);
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    let acked = Arc::new(AtomicUsize::new(0));
    for i in 0..N {
        let acked = acked.clone();
        a.send_with_callback(
            trellis_transfer::SendKey::to_destination(b_id),
            payload(format!("paid-{i}")),
            Some(Box::new(move |result| {
                result.unwrap();
                acked.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    }

    wait_for(&acked, N).await;
    wait_for(&received, N).await;
}

#[tokio::test]
async fn test_corrupted_contract_blocks_delivery() {
    let a_id = Id::new();
    let b_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());
    let b_routes = Arc::new(RouteManager::new());
    link(&a_routes, &b_routes, b_id, "ab");
    link(&b_routes, &a_routes, a_id, "ba");

    let a = Client::new(a_id, a_routes, ClientSettings::default());
    let b = Client::new(b_id, b_routes, ClientSettings::default());

    b.set_provide_modes(&[ProvideMode::Network]);
    let stored = StoredContract {
        contract_id: Id::new(),
        transfer_byte_count: 1 << 20,
        source_id: a_id,
        destination_id: b_id,
        stream_id: Id::NIL,
    };
    let contract = b
        .contract_manager()
        .seal_contract(&stored, ProvideMode::Network)
        .unwrap();

    // One flipped bit in the tag: B must refuse and deliver nothing.
    let mut tag = contract.stored_contract_hmac.to_vec();
    tag[0] ^= 0x01;
    let forged = Contract {
        stored_contract_hmac: Bytes::from(tag),
        ..contract
    };
    a.contract_manager()
        .receive_create_contract_result(CreateContractResult {
            contract: Some(forged),
            error: None,
        });

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        b.add_receive_callback(move |_| {
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    let a_for_send = a.clone();
    tokio::spawn(async move {
        let _ = a_for_send.send(b_id, payload("tainted".to_string())).await;
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outage_beyond_ack_timeout_fails_sends() {
    let a_id = Id::new();
    let b_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());

    // No route toward B at all: a black hole.
    let mut settings = ClientSettings::default();
    settings.ack_timeout = Duration::from_secs(3);
    settings.write_timeout = Duration::from_millis(200);
    let a = Client::new(a_id, a_routes, settings);
    a.contract_manager().add_send_no_contract_peer(b_id);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    a.send_with_callback(
        trellis_transfer::SendKey::to_destination(b_id),
        payload("into the void".to_string()),
        Some(Box::new(move |result| {
            done_tx.send(result).ok();
        })),
    )
    .await
    .unwrap();

    let result = timeout(Duration::from_secs(120), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransferError::AckTimeout)));
}

#[tokio::test]
async fn test_loopback_bypasses_wire() {
    let a_id = Id::new();
    let a = Client::new(a_id, Arc::new(RouteManager::new()), ClientSettings::default());

    let received = Arc::new(AtomicUsize::new(0));
    {
        let received = received.clone();
        a.add_receive_callback(move |event| {
            assert_eq!(event.source.source_id, event.source.destination_id);
            received.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    a.send_with_callback(
        trellis_transfer::SendKey::to_destination(a_id),
        payload("to self".to_string()),
        Some(Box::new(move |result| {
            done_tx.send(result).ok();
        })),
    )
    .await
    .unwrap();

    done_rx.await.unwrap().unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_control_sync_survives_route_flaps() {
    const BURSTS: usize = 3;
    const BURST_SIZE: usize = 8;

    let a_id = Id::new();
    let a_routes = Arc::new(RouteManager::new());
    let control_routes = Arc::new(RouteManager::new());
    link(&a_routes, &control_routes, CONTROL_ID, "ctl-up");
    link(&control_routes, &a_routes, a_id, "ctl-down");

    let mut settings = ClientSettings::default();
    settings.resend_interval = Duration::from_millis(100);
    let a = Client::new(a_id, a_routes.clone(), settings.clone());
    let control = Client::new(CONTROL_ID, control_routes.clone(), settings);
    control
        .contract_manager()
        .add_receive_no_contract_peer(a_id);

    // Observed audit indices must be non-decreasing per burst.
    let observed = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicUsize::new(0));
    {
        let observed = observed.clone();
        let count = count.clone();
        control.add_receive_callback(move |event| {
            for frame in &event.frames {
                if let Ok(ControlMessage::PeerAudit(audit)) = ControlMessage::from_frame(frame) {
                    observed.lock().push(audit.receive_message_count);
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    for burst in 0..BURSTS {
        // Flap the uplink between bursts.
        if burst > 0 {
            a_routes.remove_transport("ctl-up-up");
            tokio::time::sleep(Duration::from_millis(50)).await;
            link(&a_routes, &control_routes, CONTROL_ID, "ctl-up");
        }
        for i in 0..BURST_SIZE {
            a.send_control(ControlMessage::PeerAudit(PeerAudit {
                source_id: a_id,
                receive_message_count: (burst * BURST_SIZE + i) as u64,
                ..PeerAudit::default()
            }));
        }
        wait_for(&count, (burst + 1) * BURST_SIZE).await;
    }

    let observed = observed.lock();
    assert_eq!(observed.len(), BURSTS * BURST_SIZE);
    for pair in observed.windows(2) {
        assert!(pair[0] <= pair[1], "control delivery regressed: {pair:?}");
    }
}
