#![cfg(test)]

use std::time::{Duration, Instant};

use super::*;
use crate::handle::Handle;

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_create_and_lookup() {
    let reg = Registry::new();

    let link = reg.open_link("/Test/a/b", LinkFlags::CREATE_ALLOWED, SyncMode::empty()).unwrap();
    assert_eq!(link.path(), "/Test/a/b");
    assert!(!link.is_folder());

    // A second lookup resolves to the same link.
    let link2 = reg.open_link("/Test/a/b", LinkFlags::empty(), SyncMode::empty()).unwrap();
    assert_eq!(link.id(), link2.id());

    assert!(reg.exists("/Test/a/b"));
    assert!(reg.is_folder("/Test/a/"));
    assert!(reg.is_leaf("/Test/a/b"));
    assert!(!reg.exists("/Test/a/missing"));

    link.ref_dec();
    link2.ref_dec();
}

#[test]
fn test_lookup_without_create_fails() {
    let reg = Registry::new();
    let err = reg
        .open_link("/Nothing/here", LinkFlags::SILENT_ERROR, SyncMode::empty())
        .unwrap_err();
    assert_eq!(err.code, ErrCode::NotFound);
}

#[test]
fn test_kind_mismatch_is_error() {
    let reg = Registry::new();
    reg.set_int("/Mix/leaf", 1);

    let err = reg
        .open_link(
            "/Mix/leaf/",
            LinkFlags::CREATE_ALLOWED | LinkFlags::SILENT_ERROR,
            SyncMode::empty(),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrCode::CreateError);

    let err = reg
        .open_link(
            "/Mix/leaf/below",
            LinkFlags::CREATE_ALLOWED | LinkFlags::SILENT_ERROR,
            SyncMode::empty(),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrCode::CreateError);
}

#[test]
fn test_invalid_names() {
    let reg = Registry::new();
    let err = reg
        .open_link(
            "/Bad/name!!",
            LinkFlags::CREATE_ALLOWED | LinkFlags::SILENT_ERROR,
            SyncMode::empty(),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrCode::CreateError);
}

#[test]
fn test_twin_auto_create_on_provider_open() {
    let reg = Registry::new();

    // Opening /A/b! with create gives the whole pair.
    let provider = reg.open_link("/A/b!", LinkFlags::CREATE_ALLOWED, SyncMode::empty()).unwrap();
    assert!(provider.is_provider());

    let value = provider.twin_link().expect("value twin");
    assert!(!value.is_provider());
    assert_eq!(value.path(), "/A/b");
    assert!(std::sync::Arc::ptr_eq(&value.twin_link().unwrap(), &provider));

    assert!(provider.is_bidir_mode());
    assert!(value.is_bidir_mode());
    assert!(!provider.is_pipe_mode());
    assert!(reg.is_folder("/A/"));

    provider.ref_dec();
}

#[test]
fn test_values_through_registry() {
    let reg = Registry::new();
    reg.set_int("/V/i", 42);
    reg.set_string("/V/s", "hello");
    reg.set_real("/V/r", 2.5);
    reg.set_bytes("/V/b", b"raw");

    assert_eq!(reg.get_int("/V/i"), Some(42));
    assert_eq!(reg.get_string("/V/i").as_deref(), Some("42"));
    assert_eq!(reg.get_string("/V/s").as_deref(), Some("hello"));
    assert_eq!(reg.get_real("/V/r"), Some(2.5));
    assert_eq!(reg.get_bytes("/V/b").as_deref(), Some(b"raw".as_slice()));
}

#[test]
fn test_relative_paths_mount_under_local() {
    let reg = Registry::new();
    reg.set_int("Plain/x", 7);
    assert_eq!(reg.get_int("/Local/Plain/x"), Some(7));
}

#[test]
fn test_items_listing() {
    let reg = Registry::new();
    reg.set_int("/List/one", 1);
    reg.set_int("/List/two", 2);
    reg.open_link("/List/sub/", LinkFlags::CREATE_ALLOWED, SyncMode::empty())
        .unwrap()
        .ref_dec();

    let mut items = reg.items("/List/");
    items.sort();
    assert_eq!(items, vec!["one".to_string(), "sub/".to_string(), "two".to_string()]);
}

#[test]
fn test_refcount_tracks_open_handles() {
    let reg = Registry::new();

    let h1 = Handle::open(&reg, "/Ref/x").unwrap();
    assert_eq!(h1.ref_count(), 1);
    let h2 = Handle::open(&reg, "/Ref/x").unwrap();
    assert_eq!(h1.ref_count(), 2);
    assert_eq!(h1.link_id(), h2.link_id());

    drop(h2);
    assert_eq!(h1.ref_count(), 1);
}

#[test]
fn test_destroy_and_zero_ref_delete() {
    let reg = Registry::new();

    let handle = Handle::open(&reg, "/Gone/deep/leaf").unwrap();
    let link = reg.open_link("/Gone/deep/leaf", LinkFlags::empty(), SyncMode::empty()).unwrap();
    link.ref_dec();

    reg.destroy_path("/Gone/", true);
    wait_for(|| link.is_retired());

    // A retired path rejects new lookups.
    let err = reg
        .open_link("/Gone/deep/leaf", LinkFlags::SILENT_ERROR, SyncMode::empty())
        .unwrap_err();
    assert!(matches!(err.code, ErrCode::Retired | ErrCode::NotFound));

    // The retired handle was closed by the retire event.
    wait_for(|| !handle.is_open());

    // With the last reference gone the retired spine collapses.
    drop(handle);
    wait_for(|| !reg.exists("/Gone/deep/leaf") && !reg.is_folder("/Gone/"));
}

#[test]
fn test_isolated_registries() {
    let reg_a = Registry::new();
    let reg_b = Registry::new();

    reg_a.set_int("/Only/a", 1);
    assert!(reg_a.exists("/Only/a"));
    assert!(!reg_b.exists("/Only/a"));
}

#[test]
fn test_cross_thread_open() {
    let reg = Registry::new();
    let reg2 = reg.clone();

    let joined = std::thread::spawn(move || {
        let handle = Handle::open(&reg2, "/Thr/value").unwrap();
        handle.set_int(11);
        handle.to_int()
    })
    .join()
    .unwrap();

    assert_eq!(joined, Some(11));
    assert_eq!(reg.get_int("/Thr/value"), Some(11));
}
