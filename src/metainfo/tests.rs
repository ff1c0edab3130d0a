use super::*;
use crate::bencode::{encode, Value};
use sha1::{Digest, Sha1};

fn single_file_torrent(data: &[u8], piece_length: usize) -> Vec<u8> {
    let pieces: Vec<u8> = data
        .chunks(piece_length)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect();
    let info = Value::dict([
        ("length", Value::Integer(data.len() as i64)),
        ("name", Value::string("movie.bin")),
        ("piece length", Value::Integer(piece_length as i64)),
        ("pieces", Value::from(pieces)),
    ]);
    encode(&Value::dict([
        ("announce", Value::string("http://tracker.example/announce")),
        ("info", info),
    ]))
}

#[test]
fn test_info_hash_from_hex() {
    let hex = "0123456789abcdef0123456789abcdef01234567";
    let hash = InfoHash::from_hex(hex).unwrap();
    assert_eq!(hash.to_hex(), hex);
    assert_eq!(format!("{hash}"), hex);
}

#[test]
fn test_info_hash_rejects_bad_input() {
    assert!(InfoHash::from_hex("abc").is_err());
    assert!(InfoHash::from_hex("zz23456789abcdef0123456789abcdef01234567").is_err());
    assert!(InfoHash::from_bytes(&[0u8; 32]).is_err());
}

#[test]
fn test_parse_single_file() {
    let data = vec![7u8; 40_000];
    let bytes = single_file_torrent(&data, 16384);
    let torrent = Metainfo::from_bytes(&bytes).unwrap();

    assert_eq!(torrent.info.name, "movie.bin");
    assert_eq!(torrent.info.piece_count(), 3);
    assert_eq!(torrent.info.total_length, 40_000);
    assert_eq!(torrent.info.piece_size(0), 16384);
    assert_eq!(torrent.info.piece_size(2), 40_000 - 2 * 16384);
    assert_eq!(torrent.info.files.len(), 1);
    assert_eq!(
        torrent.tracker_tiers(),
        vec![vec!["http://tracker.example/announce".to_string()]]
    );

    let expected: [u8; 20] = Sha1::digest(torrent.raw_info()).into();
    assert_eq!(torrent.info_hash.0, expected);
}

#[test]
fn test_parse_multi_file_with_tiers() {
    let files = Value::List(vec![
        Value::dict([
            ("length", Value::Integer(10)),
            ("path", Value::List(vec![Value::string("a"), Value::string("x.txt")])),
        ]),
        Value::dict([
            ("length", Value::Integer(30)),
            ("path", Value::List(vec![Value::string("b.txt")])),
        ]),
    ]);
    let info = Value::dict([
        ("files", files),
        ("name", Value::string("pack")),
        ("piece length", Value::Integer(32)),
        ("pieces", Value::from(vec![0u8; 40])),
    ]);
    let bytes = encode(&Value::dict([
        (
            "announce-list",
            Value::List(vec![
                Value::List(vec![Value::string("http://t1/a"), Value::string("http://t2/a")]),
                Value::List(vec![]),
                Value::List(vec![Value::string("http://t3/a")]),
            ]),
        ),
        ("info", info),
    ]));

    let torrent = Metainfo::from_bytes(&bytes).unwrap();
    assert_eq!(torrent.info.total_length, 40);
    assert_eq!(torrent.info.files[1].offset, 10);
    assert_eq!(torrent.info.files[0].path, std::path::Path::new("pack/a/x.txt"));
    assert_eq!(torrent.tracker_tiers().len(), 2);
    assert_eq!(torrent.tracker_tiers()[0][1], "http://t2/a");
}

#[test]
fn test_rejects_path_traversal() {
    let info = Value::dict([
        (
            "files",
            Value::List(vec![Value::dict([
                ("length", Value::Integer(1)),
                ("path", Value::List(vec![Value::string(".."), Value::string("evil")])),
            ])]),
        ),
        ("name", Value::string("pack")),
        ("piece length", Value::Integer(32)),
        ("pieces", Value::from(vec![0u8; 20])),
    ]);
    let bytes = encode(&Value::dict([("info", info)]));
    assert!(matches!(
        Metainfo::from_bytes(&bytes),
        Err(MetainfoError::PathTraversal(_))
    ));
}

#[test]
fn test_rejects_piece_count_mismatch() {
    let info = Value::dict([
        ("length", Value::Integer(100)),
        ("name", Value::string("x")),
        ("piece length", Value::Integer(32)),
        ("pieces", Value::from(vec![0u8; 20])),
    ]);
    let bytes = encode(&Value::dict([("info", info)]));
    assert!(Metainfo::from_bytes(&bytes).is_err());
}

#[test]
fn test_missing_info() {
    assert!(matches!(
        Metainfo::from_bytes(b"d8:announce3:urle"),
        Err(MetainfoError::Bencode(_))
    ));
}
