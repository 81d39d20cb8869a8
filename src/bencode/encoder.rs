use super::Value;

/// Encodes a [`Value`] back into its bencode wire representation.
///
/// Dict keys are emitted in the [`BTreeMap`](std::collections::BTreeMap)'s
/// already-sorted order, which is the canonical bencode dict ordering.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, value) in map {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::decode;
    use super::*;
    use std::collections::BTreeMap;

    // S1: encode({b"cow": b"moo", b"spam": b"eggs"}) = b"d3:cow3:moo4:spam4:eggse"
    #[test]
    fn test_encode_dict() {
        let mut map = BTreeMap::new();
        map.insert(b"cow".to_vec(), Value::Bytes(b"moo".to_vec()));
        map.insert(b"spam".to_vec(), Value::Bytes(b"eggs".to_vec()));
        assert_eq!(
            encode(&Value::Dict(map)),
            b"d3:cow3:moo4:spam4:eggse".to_vec()
        );
    }

    // S1: encode([b"spam", 42]) = b"l4:spami42ee"
    #[test]
    fn test_encode_list() {
        let list =
            Value::List(vec![Value::from("spam"), Value::Int(42)]);
        assert_eq!(encode(&list), b"l4:spami42ee".to_vec());
    }

    #[test]
    fn test_roundtrip() {
        let cases: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spami42ee",
            b"d3:bar4:spam3:fooi42ee",
        ];
        for &input in cases {
            let value = decode(input).unwrap();
            assert_eq!(encode(&value), input);
        }
    }
}
