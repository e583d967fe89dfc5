#![cfg(test)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::event::LinkEvent;
use crate::registry::Registry;
use crate::value::Variant;

fn int_events(handle: &Handle) -> Arc<Mutex<Vec<(u32, Option<i64>)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let core = handle.core().clone();
    handle.set_on_event(Arc::new(move |ev: &LinkEvent| {
        if let LinkEvent::ValueChanged { send_id, .. } = ev {
            let value = core.link().and_then(|l| l.to_int());
            seen2.lock().push((*send_id, value));
        }
    }));
    seen
}

#[test]
fn test_typed_set_get() {
    let reg = Registry::new();
    let handle = Handle::open(&reg, "/T/v").unwrap();

    handle.set_int(5);
    assert_eq!(handle.to_int(), Some(5));
    assert_eq!(handle.to_string_val().as_deref(), Some("5"));

    handle.set_string("deux");
    assert_eq!(handle.to_string_val().as_deref(), Some("deux"));
    assert_eq!(handle.to_int(), None);

    handle.set_real(1.5);
    assert_eq!(handle.to_real(), Some(1.5));
    assert_eq!(handle.to_bool(), Some(true));
}

#[test]
fn test_echo_suppression() {
    let reg = Registry::new();
    let writer = Handle::open(&reg, "/E/v").unwrap();
    let other = Handle::open(&reg, "/E/v").unwrap();

    writer.set_block_echo(true);
    let writer_seen = int_events(&writer);
    let other_seen = int_events(&other);

    writer.set_int(7);

    // The writer's own callback stays silent, every other subscriber sees
    // exactly one change carrying the new value.
    assert!(writer_seen.lock().is_empty());
    let other_seen = other_seen.lock();
    assert_eq!(other_seen.len(), 1);
    assert_eq!(other_seen[0], (writer.id(), Some(7)));
}

#[test]
fn test_ignore_same_value() {
    let reg = Registry::new();
    let writer = Handle::open(&reg, "/I/v").unwrap();
    let other = Handle::open(&reg, "/I/v").unwrap();
    writer.set_ignore_same_value(true);

    writer.set_int(3);
    let count_after_first = writer.local_update_count();
    let other_seen = int_events(&other);

    writer.set_int(3); // same value: no event anywhere ...
    assert!(other_seen.lock().is_empty());
    // ... but the touch still counts as a local update.
    assert_eq!(writer.local_update_count(), count_after_first + 1);

    writer.set_int(4); // different value flows again
    assert_eq!(other_seen.lock().len(), 1);
}

#[test]
fn test_pipe_mode_forces_no_dedup() {
    let reg = Registry::new();
    let pipe = Handle::open(&reg, "/P/chan").unwrap();
    pipe.set_ignore_same_value(true);
    pipe.set_pipe_mode();

    assert!(pipe.is_pipe_mode());
    assert!(pipe.is_bidir_mode()); // pipe implies the pair
    assert!(!pipe.is_ignore_same_value());

    // Repeated identical writes each produce an event on the provider half.
    let listener = Handle::open(&reg, "/P/chan!").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    listener.set_on_event(Arc::new(move |ev: &LinkEvent| {
        if matches!(ev, LinkEvent::ValueChanged { .. }) {
            count2.fetch_add(1, Ordering::Relaxed);
        }
    }));

    pipe.set_string("ping");
    pipe.set_string("ping");
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn test_uncrossed_writes() {
    let reg = Registry::new();
    let provider = Handle::open(&reg, "/U/x!").unwrap();
    let value = Handle::open(&reg, "/U/x").unwrap();

    // A crossed write through the provider half lands on the value half;
    // reads never cross.
    provider.set_int(1);
    assert_eq!(value.to_int(), Some(1));
    assert_eq!(provider.to_int(), None);

    // An uncrossed write stays on the provider half.
    provider.set_uncrossed(true);
    provider.set_int(2);
    assert_eq!(provider.to_int(), Some(2));
    assert_eq!(value.to_int(), Some(1));
}

#[test]
fn test_atomic_ops_with_provider() {
    let reg = Registry::new();
    let provider = Handle::open(&reg, "/Op/n!").unwrap();
    let value = Handle::open(&reg, "/Op/n").unwrap();
    provider.set_atomic_op_provider();

    value.set_bits(0x0f, 0x05);
    value.add_value(0x30);

    // Both halves converge on the sequential composition.
    assert_eq!(value.to_int(), Some(0x35));
    assert_eq!(provider.to_int(), Some(0x35));
}

#[test]
fn test_atomic_op_event_without_provider() {
    let reg = Registry::new();
    let value = Handle::open(&reg, "/Op2/n").unwrap();
    value.set_bidir_mode();

    let provider = Handle::open(&reg, "/Op2/n!").unwrap();
    let ops = Arc::new(Mutex::new(Vec::new()));
    let ops2 = ops.clone();
    provider.set_on_event(Arc::new(move |ev: &LinkEvent| {
        if let LinkEvent::AtomicOp { op } = ev {
            ops2.lock().push(*op);
        }
    }));

    // With no op provider in the pair, the operation is applied locally
    // and additionally surfaces as an event on the twin for a session to
    // forward.
    value.set_bits(1, 1);
    assert_eq!(value.to_int(), Some(1));
    assert_eq!(provider.to_int(), Some(1));
    let ops = ops.lock();
    assert_eq!(ops.len(), 1);
    assert!(matches!(ops[0], crate::event::AtomicOp::BitSet { mask: 1, value: 1 }));
}

#[test]
fn test_import_export_round_trip() {
    let reg = Registry::new();
    let a = Handle::open(&reg, "/X/a").unwrap();
    let b = Handle::open(&reg, "/X/b").unwrap();

    a.set_string("plain text");
    b.import(&a.export(), None, WriteMeta::null());
    assert_eq!(b.to_string_val().as_deref(), Some("plain text"));

    a.set_bytes(&[0, 159, 10, 200]);
    b.import(&a.export(), None, WriteMeta::null());
    assert_eq!(b.to_bytes().as_deref(), Some([0u8, 159, 10, 200].as_slice()));

    a.set_variant(Variant::text("temp", "21.5"));
    b.import(&a.export(), None, WriteMeta::null());
    assert_eq!(b.to_variant(), Some(Variant::text("temp", "21.5")));

    a.set_variant(Variant::bin("blob", vec![1, 2, 3]));
    b.import(&a.export(), None, WriteMeta::null());
    assert_eq!(b.to_variant(), Some(Variant::bin("blob", vec![1, 2, 3])));
}

#[test]
fn test_export_stuffs_low_byte_text() {
    let reg = Registry::new();
    let a = Handle::open(&reg, "/X/low").unwrap();

    a.set_string("\u{1}starts low");
    let exported = a.export();
    assert_eq!(exported[0], ExportCode::String as u8);

    let b = Handle::open(&reg, "/X/low2").unwrap();
    b.import(&exported, None, WriteMeta::null());
    assert_eq!(b.to_string_val().as_deref(), Some("\u{1}starts low"));
}

#[test]
fn test_remote_import_does_not_count_locally() {
    let reg = Registry::new();
    let a = Handle::open(&reg, "/C/v").unwrap();

    a.set_int(1);
    let count = a.local_update_count();
    a.import(b"2", None, WriteMeta::remote());
    assert_eq!(a.to_int(), Some(2));
    assert_eq!(a.local_update_count(), count);
}

#[test]
fn test_queued_events_poll() {
    let reg = Registry::new();
    let watcher = Handle::open(&reg, "/Q/v").unwrap();
    let intake = watcher.events();
    let seen = int_events(&watcher);

    let writer = Handle::open(&reg, "/Q/v").unwrap();
    writer.set_int(9);

    // Nothing is delivered until the owner polls.
    assert!(seen.lock().is_empty());
    assert!(!intake.is_empty());
    assert_eq!(watcher.poll_events(), 1);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_destroy_closes_handles() {
    let reg = Registry::new();
    let handle = Handle::open(&reg, "/D/v").unwrap();
    let second = Handle::open(&reg, "/D/v").unwrap();

    // Destruction runs on the registry thread; poll for its effect.
    handle.destroy(true);
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while handle.is_open() || second.is_open() {
        assert!(std::time::Instant::now() < deadline, "handles not closed in time");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

#[test]
fn test_master_after_open_is_rejected() {
    let reg = Registry::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors2 = errors.clone();
    reg.error_log().set_sink(Box::new(move |_msg, code| {
        errors2.lock().push(code);
    }));

    let handle = Handle::open(&reg, "/M/v").unwrap();
    handle.set_master();
    assert!(errors.lock().contains(&ErrCode::AlreadyOpen));
    // The late call is rejected, not just complained about.
    assert!(!handle.is_master());

    handle.set_auto_destroy();
    assert!(!handle.is_auto_destroy());

    // Set before open it sticks without complaint.
    let pre = Handle::new(&reg);
    pre.set_master();
    pre.open_with_flags("/M/w", LinkFlags::CREATE_ALLOWED).unwrap();
    assert!(pre.is_master());
}

#[test]
fn test_cross_thread_events_park_for_poll() {
    let reg = Registry::new();
    let watcher = Handle::open(&reg, "/CT/v").unwrap();
    let seen = int_events(&watcher);

    // Opening from any user thread makes the link (and its spine)
    // threaded.
    assert!(watcher.core().link().unwrap().is_threaded());

    let reg2 = reg.clone();
    std::thread::spawn(move || {
        let writer = Handle::open(&reg2, "/CT/v").unwrap();
        writer.set_int(3);
    })
    .join()
    .unwrap();

    // The foreign-thread write must not run the callback inline; it is
    // parked until the owner polls.
    assert!(seen.lock().is_empty());
    assert_eq!(watcher.poll_events(), 1);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, Some(3));
}

#[test]
fn test_any_thread_callback_runs_inline() {
    let reg = Registry::new();
    let watcher = Handle::open(&reg, "/CT/w").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    watcher.set_on_event_any_thread(Arc::new(move |ev: &LinkEvent| {
        if let LinkEvent::ValueChanged { send_id, .. } = ev {
            seen2.lock().push(*send_id);
        }
    }));

    let reg2 = reg.clone();
    std::thread::spawn(move || {
        let writer = Handle::open(&reg2, "/CT/w").unwrap();
        writer.set_int(4);
    })
    .join()
    .unwrap();

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(watcher.poll_events(), 0);
}
