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
    assert!(decode(b"i-012e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i-e").is_err());
    assert!(decode(b"i42").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert!(decode(b"5:spam").is_err());
}

#[test]
fn test_decode_list() {
    let result = decode(b"l4:spami42ee").unwrap();
    let list = result.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].as_str(), Some("spam"));
    assert_eq!(list[1].as_integer(), Some(42));
}

#[test]
fn test_decode_dict() {
    let result = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    let dict = result.as_dict().unwrap();
    assert_eq!(dict.len(), 2);
    assert_eq!(result.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
}

#[test]
fn test_decode_dict_keys_any_order() {
    // Keys out of canonical order are accepted on parse.
    let result = decode(b"d4:spam4:eggs3:cow3:mooe").unwrap();
    assert_eq!(result.get(b"cow").and_then(|v| v.as_str()), Some("moo"));
    assert_eq!(result.get(b"spam").and_then(|v| v.as_str()), Some("eggs"));
}

#[test]
fn test_decode_dict_non_string_key() {
    assert!(decode(b"di1e3:mooe").is_err());
}

#[test]
fn test_decode_trailing_data() {
    assert!(matches!(
        decode(b"i42eextra"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn test_decode_prefix_leaves_rest() {
    let (value, consumed) = decode_prefix(b"i42eextra").unwrap();
    assert_eq!(value, Value::Integer(42));
    assert_eq!(consumed, 4);

    let (value, consumed) = decode_prefix(b"d1:ai1ee5:hello").unwrap();
    assert_eq!(value.get(b"a").and_then(|v| v.as_integer()), Some(1));
    assert_eq!(consumed, 8);
}

#[test]
fn test_decode_nesting_limit() {
    let mut deep = vec![b'l'; 100];
    deep.extend(vec![b'e'; 100]);
    assert!(matches!(
        decode(&deep),
        Err(BencodeError::NestingTooDeep)
    ));
}

#[test]
fn test_encode_integer() {
    assert_eq!(encode(&Value::Integer(42)).unwrap(), b"i42e");
    assert_eq!(encode(&Value::Integer(-42)).unwrap(), b"i-42e");
    assert_eq!(encode(&Value::Integer(0)).unwrap(), b"i0e");
}

#[test]
fn test_encode_bytes() {
    assert_eq!(encode(&Value::string("spam")).unwrap(), b"4:spam");
}

#[test]
fn test_encode_list() {
    let list = Value::List(vec![Value::string("spam"), Value::Integer(42)]);
    assert_eq!(encode(&list).unwrap(), b"l4:spami42ee");
}

#[test]
fn test_encode_dict_sorted_keys() {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"spam"), Value::string("eggs"));
    dict.insert(Bytes::from_static(b"cow"), Value::string("moo"));
    assert_eq!(
        encode(&Value::Dict(dict)).unwrap(),
        b"d3:cow3:moo4:spam4:eggse"
    );
}

#[test]
fn test_round_trip() {
    let inputs: &[&[u8]] = &[
        b"i42e",
        b"4:spam",
        b"l4:spami42ee",
        b"d3:cow3:moo4:spaml1:a1:bee",
        b"de",
        b"le",
    ];
    for input in inputs {
        let value = decode(input).unwrap();
        assert_eq!(&encode(&value).unwrap(), input);
    }
}
