use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(
        decode(b"0:").unwrap(),
        Value::Bytes(Bytes::from_static(b""))
    );
}

#[test]
fn test_decode_list() {
    let result = decode(b"l4:spami42ee").unwrap();
    match result {
        Value::List(l) => {
            assert_eq!(l.len(), 2);
            assert_eq!(l[0], Value::Bytes(Bytes::from_static(b"spam")));
            assert_eq!(l[1], Value::Integer(42));
        }
        _ => panic!("expected list"),
    }
}

#[test]
fn test_decode_dict() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    match result {
        Value::Dict(d) => {
            assert_eq!(d.len(), 2);
            assert_eq!(
                d.get(&Bytes::from_static(b"cow")),
                Some(&Value::Bytes(Bytes::from_static(b"moo")))
            );
        }
        _ => panic!("expected dict"),
    }
}

#[test]
fn test_encode_integer() {
    assert_eq!(encode(&Value::Integer(42)), b"i42e");
    assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
    assert_eq!(encode(&Value::Integer(0)), b"i0e");
}

#[test]
fn test_encode_bytes() {
    assert_eq!(
        encode(&Value::Bytes(Bytes::from_static(b"spam"))),
        b"4:spam"
    );
}

#[test]
fn test_encode_list() {
    let list = Value::List(vec![
        Value::Bytes(Bytes::from_static(b"spam")),
        Value::Integer(42),
    ]);
    assert_eq!(encode(&list), b"l4:spami42ee");
}

#[test]
fn test_encode_dict() {
    let mut dict = BTreeMap::new();
    dict.insert(
        Bytes::from_static(b"cow"),
        Value::Bytes(Bytes::from_static(b"moo")),
    );
    let value = Value::Dict(dict);
    assert_eq!(encode(&value), b"d3:cow3:mooe");
}

#[test]
fn test_roundtrip() {
    // Keys must be sorted lexicographically for bencode roundtrip
    let original = b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee";
    let decoded = decode(original).unwrap();
    let encoded = encode(&decoded);
    assert_eq!(encoded, original);
}

#[test]
fn test_nested_structures() {
    let data = b"d4:listl4:spami42eee";
    let decoded = decode(data).unwrap();
    let encoded = encode(&decoded);
    assert_eq!(encoded, data);
}

#[test]
fn test_trailing_data_error() {
    assert!(decode(b"i42eextra").is_err());
}

#[test]
fn test_value_accessors() {
    let value = Value::Integer(42);
    assert_eq!(value.as_integer(), Some(42));
    assert!(value.as_bytes().is_none());

    let value = Value::Bytes(Bytes::from_static(b"test"));
    assert_eq!(value.as_str(), Some("test"));
    assert!(value.as_integer().is_none());

    let value = Value::List(vec![]);
    assert!(value.as_list().is_some());
    assert!(value.as_dict().is_none());
}

#[test]
fn test_dict_keys_must_be_sorted() {
    assert!(matches!(
        decode(b"d4:spam4:eggs3:cow3:mooe"),
        Err(BencodeError::UnsortedKeys(_))
    ));
    assert!(matches!(
        decode(b"d3:cowi1e3:cowi2ee"),
        Err(BencodeError::UnsortedKeys(_))
    ));
}

#[test]
fn test_dict_key_must_be_string() {
    assert!(decode(b"di1ei2ee").is_err());
}

#[test]
fn test_string_length_overflow() {
    assert!(decode(b"99999999999999999999999:x").is_err());
    assert!(decode(b"5:abc").is_err());
}

#[test]
fn test_nesting_limit() {
    let mut deep = vec![b'l'; 100];
    deep.extend(vec![b'e'; 100]);
    assert!(matches!(decode(&deep), Err(BencodeError::NestingTooDeep)));
}

#[test]
fn test_decode_prefix_reports_consumed() {
    let (value, used) = decode_prefix(b"d1:ai1eeRAWDATA").unwrap();
    assert_eq!(used, 8);
    assert_eq!(value.get(b"a").and_then(Value::as_integer), Some(1));
}

#[test]
fn test_dict_builder_encodes_sorted() {
    let value = Value::dict([("z", Value::Integer(1)), ("a", Value::string("x"))]);
    assert_eq!(encode(&value), b"d1:a1:x1:zi1ee");
}

#[test]
fn test_dict_reader_required_and_optional() {
    let value = decode(b"d1:ai7e1:b3:xyz1:cli1eee").unwrap();
    let reader = DictReader::new(&value, "test").unwrap();

    assert_eq!(reader.int("a").unwrap(), 7);
    assert_eq!(reader.uint::<u8>("a").unwrap(), 7);
    assert_eq!(reader.str("b").unwrap(), "xyz");
    assert_eq!(reader.list("c").unwrap().len(), 1);
    assert_eq!(reader.opt_int("missing").unwrap(), None);
    assert!(matches!(reader.int("missing"), Err(BencodeError::MissingKey("missing"))));
}

#[test]
fn test_dict_reader_wrong_type() {
    let value = decode(b"d1:a3:xyze").unwrap();
    let reader = DictReader::new(&value, "test").unwrap();
    assert!(matches!(
        reader.opt_int("a"),
        Err(BencodeError::WrongType { key: "a", .. })
    ));
    assert!(DictReader::new(&Value::Integer(1), "test").is_err());
}

#[test]
fn test_dict_reader_range_check() {
    let value = decode(b"d1:ai-1e1:bi300ee").unwrap();
    let reader = DictReader::new(&value, "test").unwrap();
    assert!(reader.uint::<u32>("a").is_err());
    assert!(reader.uint::<u8>("b").is_err());
    assert_eq!(reader.uint::<u16>("b").unwrap(), 300);
}

struct Pair {
    name: String,
    size: u64,
}

impl FromBencode for Pair {
    fn from_bencode(value: &Value) -> Result<Self, BencodeError> {
        let dict = DictReader::new(value, "pair")?;
        Ok(Pair {
            name: dict.str("name")?.to_string(),
            size: dict.uint("size")?,
        })
    }
}

#[test]
fn test_from_bencode_ignores_unknown_keys() {
    let pair = Pair::from_bencode_bytes(b"d5:extrai1e4:name3:abc4:sizei9ee").unwrap();
    assert_eq!(pair.name, "abc");
    assert_eq!(pair.size, 9);

    assert!(Pair::from_bencode_bytes(b"d4:name3:abce").is_err());
}
