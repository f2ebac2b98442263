use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlgate::core::buffer::BufChain;
use sqlgate::core::worker::{CallbackReason, DcbRole, DcbState, Descriptor};

fn client_dcb() -> Descriptor {
    Descriptor::new(1, DcbRole::ClientHandler, 0)
}

#[test]
fn test_state_machine_transitions() {
    let mut dcb = client_dcb();
    assert_eq!(dcb.state(), DcbState::Alloc);
    dcb.register();
    assert_eq!(dcb.state(), DcbState::Polling);
    dcb.pause();
    assert_eq!(dcb.state(), DcbState::NoPolling);
    dcb.resume();
    assert_eq!(dcb.state(), DcbState::Polling);
    dcb.close();
    assert_eq!(dcb.state(), DcbState::Disconnected);
    // Pause/resume are no-ops once disconnected.
    dcb.pause();
    assert_eq!(dcb.state(), DcbState::Disconnected);
}

#[test]
fn test_listener_registers_as_listening() {
    let mut dcb = Descriptor::new(2, DcbRole::Listener, 0);
    dcb.register();
    assert_eq!(dcb.state(), DcbState::Listening);
}

#[test]
fn test_watermark_fires_exactly_once_per_crossing() {
    let mut dcb = client_dcb();
    dcb.set_watermarks(4, 10);
    let highs = Arc::new(AtomicUsize::new(0));
    let lows = Arc::new(AtomicUsize::new(0));
    let h = highs.clone();
    dcb.add_callback(CallbackReason::HighWater, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    let l = lows.clone();
    dcb.add_callback(CallbackReason::LowWater, move |_| {
        l.fetch_add(1, Ordering::SeqCst);
    });

    dcb.enqueue_write(BufChain::from_vec(vec![0u8; 8]));
    assert_eq!(highs.load(Ordering::SeqCst), 0);
    dcb.enqueue_write(BufChain::from_vec(vec![0u8; 8]));
    assert_eq!(highs.load(Ordering::SeqCst), 1);
    assert!(dcb.throttled());
    // Still above: no second HighWater.
    dcb.enqueue_write(BufChain::from_vec(vec![0u8; 8]));
    assert_eq!(highs.load(Ordering::SeqCst), 1);

    // Drain until below low water: exactly one LowWater.
    let drained = dcb.dequeue_write(21);
    assert_eq!(drained.len(), 21);
    assert_eq!(lows.load(Ordering::SeqCst), 1);
    assert!(!dcb.throttled());
    dcb.dequeue_write(100);
    assert_eq!(lows.load(Ordering::SeqCst), 1);

    // A second crossing fires again.
    dcb.enqueue_write(BufChain::from_vec(vec![0u8; 16]));
    assert_eq!(highs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_callbacks_fire_in_registration_order() {
    let mut dcb = client_dcb();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = order.clone();
        dcb.add_callback(CallbackReason::Hangup, move |_| {
            order.lock().push(tag);
        });
    }
    dcb.on_hangup();
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[test]
fn test_error_and_hangup_are_idempotent() {
    let mut dcb = client_dcb();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    dcb.add_callback(CallbackReason::Error, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    dcb.on_error();
    dcb.on_error();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_close_delivers_close_callback_once() {
    let mut dcb = client_dcb();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    dcb.add_callback(CallbackReason::Close, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    dcb.close();
    dcb.close();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_remove_callback() {
    let mut dcb = client_dcb();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let token = dcb.add_callback(CallbackReason::Hangup, move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });
    assert!(dcb.remove_callback(CallbackReason::Hangup, token));
    dcb.on_hangup();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_read_stats() {
    let mut dcb = client_dcb();
    dcb.buffer_read(BufChain::from_slice(b"hello"));
    dcb.buffer_read(BufChain::from_slice(b"world"));
    assert_eq!(dcb.stats().n_reads, 2);
    assert_eq!(dcb.stats().bytes_read, 10);
    assert_eq!(dcb.read_queue().to_vec(), b"helloworld");
}
