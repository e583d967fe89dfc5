#![cfg(test)]

use super::*;

#[test]
fn test_int_conversions() {
    let mut cell = Cell::new();
    cell.set_int(42);
    assert_eq!(cell.data_type(), DataType::Int);
    assert_eq!(cell.to_int(), Some(42));
    assert_eq!(cell.to_real(), Some(42.0));
    assert_eq!(cell.to_string_val().as_deref(), Some("42"));
    assert_eq!(cell.to_bytes().as_deref(), Some(b"42".as_slice()));
}

#[test]
fn test_real_truncation() {
    let mut cell = Cell::new();
    cell.set_real(3.9);
    assert_eq!(cell.to_int(), Some(3));
    assert_eq!(cell.to_real(), Some(3.9));
}

#[test]
fn test_string_parse() {
    let mut cell = Cell::new();
    cell.set_string("17");
    assert_eq!(cell.to_int(), Some(17));
    assert_eq!(cell.to_real(), Some(17.0));

    cell.set_string("not a number");
    assert_eq!(cell.to_int(), None);
    assert_eq!(cell.to_real(), None);
    // The failed conversion must not poison the string view.
    assert_eq!(cell.to_string_val().as_deref(), Some("not a number"));
}

#[test]
fn test_bytes_passthrough() {
    let mut cell = Cell::new();
    cell.set_bytes(b"heads");
    assert_eq!(cell.to_string_val().as_deref(), Some("heads"));
    assert_eq!(cell.to_int(), None);

    cell.set_bytes(b"19");
    assert_eq!(cell.to_int(), Some(19));
}

#[test]
fn test_null_has_no_views() {
    let mut cell = Cell::new();
    assert_eq!(cell.data_type(), DataType::Null);
    assert_eq!(cell.to_int(), None);
    assert_eq!(cell.to_real(), None);
    assert_eq!(cell.to_string_val(), None);
    assert_eq!(cell.to_bytes(), None);
    assert_eq!(cell.to_variant(), None);
}

#[test]
fn test_cache_invalidated_on_write() {
    let mut cell = Cell::new();
    cell.set_string("5");
    assert_eq!(cell.to_int(), Some(5));
    cell.set_string("6");
    assert_eq!(cell.to_int(), Some(6));
    cell.set_int(9);
    assert_eq!(cell.to_string_val().as_deref(), Some("9"));
}

#[test]
fn test_variant_views() {
    let mut cell = Cell::new();
    cell.set_variant(Variant::text("temp", "21.5"));
    assert_eq!(cell.to_real(), Some(21.5));
    assert_eq!(cell.to_string_val().as_deref(), Some("21.5"));

    cell.set_variant(Variant::bin("blob", vec![1, 2, 3]));
    assert_eq!(cell.to_string_val(), None);
    assert_eq!(cell.to_int(), None);
}

#[test]
fn test_update_count() {
    let mut cell = Cell::new();
    assert_eq!(cell.local_update_count(), 0);
    cell.set_int(1);
    cell.bump_update_count();
    cell.bump_update_count(); // an ignored-same write still counts
    assert_eq!(cell.local_update_count(), 2);
}
