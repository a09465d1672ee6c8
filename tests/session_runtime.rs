//! End-to-end session scenarios driven through the manager's public
//! operations, without a real socket: connect, interact, disconnect,
//! replay, rate limits, liveness.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use weft::{
    Config, ConnectOutcome, ConnectParams, ClientInfo, RateLimit, RootFn, SessionManager,
    Template, View, WindowId,
};

fn ip() -> IpAddr {
    "10.0.0.1".parse().expect("literal address")
}

fn new_window_params() -> ConnectParams {
    ConnectParams {
        window_id: None,
        read_offset: 0,
        info: ClientInfo::default(),
        ip: ip(),
    }
}

fn reconnect_params(id: WindowId, read_offset: u64) -> ConnectParams {
    ConnectParams {
        window_id: Some(id),
        read_offset,
        info: ClientInfo::default(),
        ip: ip(),
    }
}

fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    out
}

/// A root that renders a template block with one dynamic text anchor and
/// registers a handler (port 3) that rewrites the text.
fn counter_root() -> RootFn {
    Arc::new(|cx| {
        let (count, set_count) = cx.create_signal(0i64);
        cx.create_handler(move |cx, _args| {
            set_count.update(cx, |n| n + 1);
            Ok(())
        });
        let template = Template::new(1, vec!["div".to_string()], vec![0; 40], vec![]);
        let block = cx.create_block(
            &template,
            vec![View::dynamic(move |cx| Ok(View::Int(count.get(cx))))],
            vec![],
            vec![],
            &[],
        )?;
        Ok(View::Block(block))
    })
}

/// Port 3 with an empty argument list.
fn invoke_handler_frame() -> Vec<u8> {
    vec![3, 0, 0, 0, 0]
}

fn connect(
    mgr: &mut SessionManager,
) -> (WindowId, UnboundedReceiver<Vec<u8>>) {
    let (tx, rx) = unbounded_channel();
    match mgr.apply_new_connection(new_window_params(), tx) {
        ConnectOutcome::Accepted { window_id } => (window_id, rx),
        other => panic!("connection not accepted: {other:?}"),
    }
}

fn settle(mgr: &mut SessionManager) {
    while mgr.service_next() {}
}

#[test]
fn test_initial_render_reaches_the_sink() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);

    let bytes = drain(&mut rx);
    assert!(!bytes.is_empty());
    // INIT_WINDOW with this window's id leads the stream.
    assert_eq!(bytes[0], 2);
    assert_eq!(&bytes[1..22], id.as_str().as_bytes());
    assert_eq!(mgr.window_count(), 1);
}

#[test]
fn test_input_before_work_and_in_receipt_order() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    drain(&mut rx);

    // Three events in one batch: the effect must observe the fully
    // applied batch, producing one re-render with the final count.
    mgr.enqueue_message(id.clone(), invoke_handler_frame());
    mgr.enqueue_message(id.clone(), invoke_handler_frame());
    mgr.enqueue_message(id.clone(), invoke_handler_frame());
    settle(&mut mgr);

    let bytes = drain(&mut rx);
    assert!(bytes.windows(1).any(|w| w == b"3"), "batch applied as a whole");
    assert!(!bytes.windows(1).any(|w| w == b"1"), "no intermediate render");
}

#[test]
fn test_reconnect_replays_byte_identical_tail() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    let phase1 = drain(&mut rx);
    assert!(phase1.len() > 30);

    // Client drops mid-stream having acknowledged only 25 bytes.
    mgr.disconnect_window(&id);
    drop(rx);

    let (tx2, mut rx2) = unbounded_channel();
    let outcome = mgr.apply_new_connection(reconnect_params(id.clone(), 25), tx2);
    assert!(matches!(outcome, ConnectOutcome::Accepted { .. }));
    settle(&mut mgr);

    let replayed = drain(&mut rx2);
    assert_eq!(
        replayed, &phase1[25..],
        "replayed tail must be byte-for-byte identical"
    );
}

#[test]
fn test_work_while_disconnected_delivered_on_reconnect() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    let phase1 = drain(&mut rx);

    mgr.disconnect_window(&id);
    drop(rx);

    // State keeps moving while the client is away.
    mgr.enqueue_message(id.clone(), invoke_handler_frame());
    settle(&mut mgr);

    let (tx2, mut rx2) = unbounded_channel();
    let outcome = mgr.apply_new_connection(reconnect_params(id.clone(), phase1.len() as u64), tx2);
    assert!(matches!(outcome, ConnectOutcome::Accepted { .. }));
    settle(&mut mgr);

    let tail = drain(&mut rx2);
    assert!(!tail.is_empty(), "offline work flushes on reconnect");
    assert!(tail.windows(1).any(|w| w == b"1"), "new count reached the client");
}

#[test]
fn test_reconnect_unknown_window_rejected() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (tx, _rx) = unbounded_channel();
    let outcome = mgr.apply_new_connection(reconnect_params(WindowId::random(), 0), tx);
    assert_eq!(outcome, ConnectOutcome::UnknownWindow);
}

#[test]
fn test_reconnect_with_pruned_offset_destroys_window() {
    // Tiny pages so acknowledgment actually releases early pages.
    let cfg = Config::default().page_size(64);
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    let phase1 = drain(&mut rx);
    assert!(phase1.len() > 64, "stream must span several pages");

    // Pong carrying a full acknowledgment: earlier pages are pruned.
    let mut pong = vec![0, 0];
    weft::wire::encode_values(&mut pong, &[weft::Value::Int(phase1.len() as i64)])
        .expect("pong encoding");
    mgr.enqueue_message(id.clone(), pong);
    settle(&mut mgr);

    mgr.disconnect_window(&id);
    let (tx2, _rx2) = unbounded_channel();
    let outcome = mgr.apply_new_connection(reconnect_params(id, 0), tx2);
    assert_eq!(
        outcome,
        ConnectOutcome::UnknownWindow,
        "a pruned offset cannot be replayed; the client must reload"
    );
    assert_eq!(mgr.window_count(), 0, "the unreplayable window is destroyed");
}

#[test]
fn test_window_creation_rate_limited() {
    let cfg = Config::default().create_rate(RateLimit {
        capacity: 2.0,
        per_second: 0.0,
    });
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());

    let (tx1, _rx1) = unbounded_channel();
    let (tx2, _rx2) = unbounded_channel();
    let (tx3, _rx3) = unbounded_channel();
    assert!(matches!(
        mgr.apply_new_connection(new_window_params(), tx1),
        ConnectOutcome::Accepted { .. }
    ));
    assert!(matches!(
        mgr.apply_new_connection(new_window_params(), tx2),
        ConnectOutcome::Accepted { .. }
    ));
    assert_eq!(
        mgr.apply_new_connection(new_window_params(), tx3),
        ConnectOutcome::RateLimited
    );
}

#[test]
fn test_over_budget_messages_dropped_not_queued() {
    let cfg = Config::default().message_rate(RateLimit {
        capacity: 2.0,
        per_second: 0.0,
    });
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    drain(&mut rx);

    for _ in 0..5 {
        mgr.enqueue_message(id.clone(), invoke_handler_frame());
    }
    settle(&mut mgr);
    assert_eq!(mgr.dropped_message_count(), 3);

    let bytes = drain(&mut rx);
    // Only the two in-budget events applied.
    assert!(bytes.windows(1).any(|w| w == b"2"));
    assert!(!bytes.windows(1).any(|w| w == b"5"));
}

#[test]
fn test_liveness_sweep_disconnects_then_destroys() {
    let cfg = Config::default()
        .pong_timeout(Duration::ZERO)
        .destroy_timeout(Duration::ZERO);
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());
    let (_id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    drain(&mut rx);

    // First sweep: the pong deadline (zero) has passed, demote.
    mgr.liveness_sweep();
    assert_eq!(mgr.window_count(), 1, "disconnected state is kept, not destroyed");

    // Second sweep: the destroy deadline (zero) has passed too.
    mgr.liveness_sweep();
    assert_eq!(mgr.window_count(), 0);
}

#[test]
fn test_low_memory_evicts_disconnected_windows_eagerly() {
    let cfg = Config::default().destroy_timeout(Duration::from_secs(3600));
    let low_memory = cfg.low_memory.clone();
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());
    let (id, _rx) = connect(&mut mgr);
    settle(&mut mgr);

    mgr.disconnect_window(&id);
    mgr.liveness_sweep();
    assert_eq!(mgr.window_count(), 1, "within timeout, kept under normal memory");

    low_memory.store(true, Ordering::Relaxed);
    mgr.liveness_sweep();
    assert_eq!(mgr.window_count(), 0, "low memory evicts regardless of timeout");
}

#[test]
fn test_pong_refreshes_liveness() {
    let cfg = Config::default().pong_timeout(Duration::from_secs(3600));
    let (mut mgr, _handle) = SessionManager::new(cfg, counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    drain(&mut rx);

    let mut pong = vec![0, 0];
    weft::wire::encode_values(&mut pong, &[weft::Value::Int(0)]).expect("pong encoding");
    mgr.enqueue_message(id.clone(), pong);
    settle(&mut mgr);

    mgr.liveness_sweep();
    assert_eq!(mgr.window_count(), 1);
    let window = mgr.window_mut(&id).expect("window alive");
    assert!(window.is_connected());
    // The sweep pinged the connected window.
    let bytes = drain(&mut rx);
    assert!(bytes.contains(&0u8));
}

#[test]
fn test_malformed_frame_drops_message_not_window() {
    let (mut mgr, _handle) = SessionManager::new(Config::default(), counter_root());
    let (id, mut rx) = connect(&mut mgr);
    settle(&mut mgr);
    drain(&mut rx);

    // Truncated garbage, then a valid event: the window survives and
    // still applies the valid one.
    mgr.enqueue_message(id.clone(), vec![9]);
    mgr.enqueue_message(id.clone(), vec![3, 0, 2, 0, 0xFF]);
    mgr.enqueue_message(id.clone(), invoke_handler_frame());
    settle(&mut mgr);

    assert_eq!(mgr.window_count(), 1);
    let bytes = drain(&mut rx);
    assert!(bytes.windows(1).any(|w| w == b"1"));
}
