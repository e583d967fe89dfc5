#![cfg(test)]

use super::*;

#[test]
fn test_full_path() {
    assert_eq!(full_path("Test/value"), "/Local/Test/value");
    assert_eq!(full_path("/Share/Test/value"), "/Share/Test/value");
}

#[test]
fn test_convert_path_idempotent() {
    let cases = ["/a/b/c", "/a/b/", "/", "a/b", "/a/b!", "/a/b\\.c/d!"];
    for case in cases {
        let once = convert_path(case, NameFormat::DEFAULT);
        let twice = convert_path(&once, NameFormat::DEFAULT);
        assert_eq!(once, twice, "path {case}");
    }
}

#[test]
fn test_convert_path_forms() {
    assert_eq!(convert_path("/a/b/c", NameFormat::DEFAULT), "/a/b/c");
    assert_eq!(convert_path("a/b/", NameFormat::DEFAULT), "/a/b/");
    assert_eq!(convert_path("/a/b/", NameFormat::relative()), "a/b/");
    assert_eq!(convert_path("", NameFormat::DEFAULT), "/");
    // Converting through a relative form then back keeps the tail equal.
    let rel = convert_path("/x/y/z", NameFormat::relative());
    assert_eq!(convert_path(&rel, NameFormat::DEFAULT), "/x/y/z");
}

#[test]
fn test_escaped_dot_segment() {
    let path = convert_path("/a/b\\.c/d!", NameFormat::DEFAULT);
    assert_eq!(path, "/a/b\\.c/d!");
    assert_eq!(item_name(&path), "d");
    assert_eq!(twin_path(&path), "/a/b\\.c/d");
}

#[test]
fn test_item_name() {
    assert_eq!(item_name("/a/b/c"), "c");
    assert_eq!(item_name("/a/b/"), "b");
    assert_eq!(item_name("/"), "/");
    assert_eq!(item_name("/a/b!"), "b");
    assert_eq!(item_name("solo"), "solo");
}

#[test]
fn test_parent_path() {
    assert_eq!(parent_path("/a/b/c"), "/a/b/");
    assert_eq!(parent_path("/a/b/"), "/a/");
    assert_eq!(parent_path("/a"), "/");
    assert_eq!(parent_path("solo"), "");
}

#[test]
fn test_child_path() {
    assert_eq!(child_path("/a/", "/a/b/c/d"), "/a/b/");
    assert_eq!(child_path("/a", "/a/b"), "/a/b");
    assert_eq!(child_path("/a/", "/x/y"), "");
}

#[test]
fn test_change_base_path() {
    assert_eq!(change_base_path("/Local/", "/Share/", "/Local/Test/v"), "/Share/Test/v");
    assert_eq!(change_base_path("/Local", "/Share", "/Other/Test/v"), "/Other/Test/v");
    assert_eq!(change_base_path("/Same/", "/Same/", "/Same/x"), "/Same/x");
}

#[test]
fn test_twin_involution() {
    for path in ["/a/b", "/a/b!", "/x", "deep/leaf!"] {
        assert_eq!(twin_path(&twin_path(path)), path);
    }
    // Folders have no twin.
    assert_eq!(twin_path("/a/b/"), "/a/b/");
}

#[test]
fn test_provider_path_if() {
    assert_eq!(provider_path_if("/a/b", true), "/a/b!");
    assert_eq!(provider_path_if("/a/b!", true), "/a/b!");
    assert_eq!(provider_path_if("/a/b!", false), "/a/b");
}

#[test]
fn test_uuid_path() {
    let p = uuid_path("/a/b");
    assert!(p.starts_with("/a/"));
    assert!(p.ends_with("/b"));
    assert_ne!(p, uuid_path("/a/b"));

    let p = uuid_path("/a/b!");
    assert!(p.ends_with("/b!"));
    // The inserted segment must not carry the provider marker.
    let parent = parent_path(&p);
    assert!(!parent.trim_end_matches('/').ends_with('!'));
}

#[test]
fn test_make_and_add_path() {
    assert_eq!(make_path("/a/b", "c"), "/a/b/c");
    assert_eq!(make_path("/a/b/", ""), "/a/b/");
    assert_eq!(add_path("/a", "b/c", NameFormat::DEFAULT), "/a/b/c");
}

#[test]
fn test_escape_segment_round_trip() {
    let cases = ["plain", "with.dot", "back\\slash", "mix.\\.x", "ctl\u{01}end"];
    for case in cases {
        let esc = escape_segment(case);
        assert_eq!(unescape_segment(&esc), *case, "segment {case:?}");
    }
    assert_eq!(escape_segment("a\u{01}b"), "a\\001b");
}

#[test]
fn test_host_with_info() {
    assert_eq!(make_host_with_info("myhost", "site A"), "myhost  [site A]");
    assert_eq!(make_host_with_info("myhost", ""), "myhost");
    assert_eq!(make_host_with_info("myhost", "myhost"), "myhost");
    assert_eq!(host_from_host_with_info("myhost  [site A]"), "myhost");
    assert_eq!(host_from_host_with_info("myhost"), "myhost");
}
