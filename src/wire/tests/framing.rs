use crate::wire::{frame_record, DecodeError, LineDecoder, RecOptions, RecordMap};

#[test]
fn test_line_split() {
    let mut dec = LineDecoder::new();
    dec.feed(b"ver type=SyncTree\r\nRver ");
    assert_eq!(dec.next_record().unwrap(), Some(b"ver type=SyncTree".to_vec()));
    assert_eq!(dec.next_record().unwrap(), None);
    dec.feed(b"ver=5.0\r\n");
    assert_eq!(dec.next_record().unwrap(), Some(b"Rver ver=5.0".to_vec()));
    assert_eq!(dec.next_record().unwrap(), None);
}

#[test]
fn test_partial_line() {
    let mut dec = LineDecoder::new();
    dec.feed(b"flux id=");
    assert_eq!(dec.next_record().unwrap(), None);
    dec.feed(b"9\r\n");
    assert_eq!(dec.next_record().unwrap(), Some(b"flux id=9".to_vec()));
}

#[test]
fn test_frame_round_trip() {
    let framed = frame_record(b"flux id=9 data=x");
    let mut dec = LineDecoder::new();

    // Feed byte by byte; the decoder must wait for the full frame.
    for &b in &framed[..framed.len() - 1] {
        dec.feed(&[b]);
        assert_eq!(dec.next_record().unwrap(), None);
    }
    dec.feed(&framed[framed.len() - 1..]);
    assert_eq!(dec.next_record().unwrap(), Some(b"flux id=9 data=x".to_vec()));
}

#[test]
fn test_mixed_lines_and_frames() {
    let mut dec = LineDecoder::new();
    dec.feed(b"ver\r\n");
    dec.feed(&frame_record(b"sync path=/a id=1"));
    dec.feed(b"exit\r\n");

    assert_eq!(dec.next_record().unwrap(), Some(b"ver".to_vec()));
    assert_eq!(dec.next_record().unwrap(), Some(b"sync path=/a id=1".to_vec()));
    assert_eq!(dec.next_record().unwrap(), Some(b"exit".to_vec()));
}

#[test]
fn test_oversize_frame_rejected() {
    let mut dec = LineDecoder::new();
    dec.feed(&[0x02, 0xff, 0xff, 0xff, 0xff]);
    assert_eq!(dec.next_record(), Err(DecodeError::FrameTooLong));
}

#[test]
fn test_framed_record_through_map() {
    let opts = RecOptions::for_version(4);
    let mut map = RecordMap::command("flux");
    map.add_num("id", 4).add("data", b"\x01\x02bin");

    let wire = map.to_wire(opts);
    let mut dec = LineDecoder::new();
    dec.feed(&wire);
    let payload = dec.next_record().unwrap().expect("one frame");
    let back = RecordMap::from_line(&payload, opts).unwrap();
    assert_eq!(back, map);
}
