use crate::wire::{RecOptions, RecordMap};

fn round_trip(map: &RecordMap, opts: RecOptions) -> RecordMap {
    let line = map.to_line(opts);
    RecordMap::from_line(&line, opts).expect("parse back")
}

#[test]
fn test_command_and_fields() {
    let mut map = RecordMap::command("flux");
    map.add_num("id", 17).add("data", b"7");

    assert_eq!(map.command_word(), b"flux");
    assert_eq!(map.value_num("id", 0), 17);
    assert_eq!(map.value("data"), Some(b"7".as_slice()));
    assert_eq!(map.value("missing"), None);
    assert_eq!(map.value_num("missing", -1), -1);
}

#[test]
fn test_line_form() {
    let mut map = RecordMap::command("sync");
    map.add_str("path", "/Test/a b/c").add_num("id", 3);

    let line = map.to_line(RecOptions::default());
    assert_eq!(line, b"sync path=/Test/a\\_b/c id=3".to_vec());

    let back = RecordMap::from_line(&line, RecOptions::default()).unwrap();
    assert_eq!(back, map);
}

#[test]
fn test_escaping_round_trip() {
    let payloads: &[&[u8]] = &[
        b"plain",
        b"with space",
        b"key=value",
        b"back\\slash",
        b"\x01binary\x02tail",
        b"\r\nline",
        b"~tilde",
        b"",
    ];
    for opts in [
        RecOptions::default(),
        RecOptions { null_tilde: true, repeat_len: true, frame: false },
    ] {
        for payload in payloads {
            let mut map = RecordMap::command("x");
            map.add("data", payload);
            let back = round_trip(&map, opts);
            assert_eq!(back.value("data"), Some(*payload), "payload {payload:?} opts {opts:?}");
        }
    }
}

#[test]
fn test_null_tilde() {
    let opts = RecOptions { null_tilde: true, ..Default::default() };
    let mut map = RecordMap::command("mode");
    map.add("data", b"");

    let line = map.to_line(opts);
    assert_eq!(line, b"mode data=~".to_vec());
    let back = RecordMap::from_line(&line, opts).unwrap();
    assert_eq!(back.value("data"), Some(b"".as_slice()));
}

#[test]
fn test_repeat_key_elision() {
    let opts = RecOptions { repeat_len: true, ..Default::default() };
    let mut map = RecordMap::command("ls");
    map.add_str("item", "a").add_str("item", "b").add_str("item", "c");

    let line = map.to_line(opts);
    assert_eq!(line, b"ls item=a *=b *=c".to_vec());
    let back = RecordMap::from_line(&line, opts).unwrap();
    assert_eq!(back, map);
}

#[test]
fn test_enumerated_items() {
    let mut map = RecordMap::command("Rls");
    map.add_enum("item", 1, "x/").add_enum("item", 2, "y");

    assert_eq!(map.max_enum_of("item"), 2);
    assert_eq!(map.value_enum("item", 1), Some(b"x/".as_slice()));
    assert_eq!(map.value_enum("item", 2), Some(b"y".as_slice()));
    assert_eq!(map.value_enum("item", 3), None);
}

#[test]
fn test_bare_values() {
    let mut map = RecordMap::command("Rinfo");
    map.add_values(["/Local/Sys/Legal/", "/Free/"]);

    let back = round_trip(&map, RecOptions::default());
    let values = back.values();
    assert_eq!(values, vec![b"/Local/Sys/Legal/".to_vec(), b"/Free/".to_vec()]);
}

#[test]
fn test_bad_escape() {
    assert!(RecordMap::from_line(b"cmd data=\\x", RecOptions::default()).is_err());
    assert!(RecordMap::from_line(b"cmd data=\\9", RecOptions::default()).is_err());
    assert!(RecordMap::from_line(b"cmd data=\\999", RecOptions::default()).is_err());
    assert!(RecordMap::from_line(b"cmd data=trail\\", RecOptions::default()).is_err());
}

#[test]
fn test_version_options() {
    assert_eq!(RecOptions::for_version(3), RecOptions::default());
    let v4 = RecOptions::for_version(4);
    assert!(v4.null_tilde && v4.repeat_len && v4.frame);
}
