// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.


use crate::{DeOptions, Heap, SerOptions, Value, value_from_slice, value_to_vec};
use crate::error::ErrorCode;

fn dumps(heap: &Heap, value: &Value, proto: i32) -> Vec<u8> {
    value_to_vec(heap, value, SerOptions::new().proto(proto)).unwrap()
}

fn loads(data: &[u8]) -> (Heap, Value) {
    value_from_slice(data, DeOptions::new()).unwrap()
}

fn load_error(data: &[u8]) -> ErrorCode {
    match value_from_slice(data, DeOptions::new()) {
        Ok((heap, value)) => panic!("unexpectedly loaded {}", heap.display(&value)),
        Err(err) => err.code().cloned().expect("not an eval error"),
    }
}

fn repr(data: &[u8]) -> String {
    let (heap, value) = loads(data);
    heap.display(&value).to_string()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

mod value_tests {
    use num_bigint::BigInt;
    use crate::{Heap, HashableValue, Object, Value};
    use crate::error::ErrorCode;

    #[test]
    fn display() {
        let mut heap = Heap::new();
        let s = heap.string("a");
        let list = heap.list(vec![Value::I64(1), s, Value::None]);
        assert_eq!(heap.display(&list).to_string(), r#"[1, "a", None]"#);

        let single = heap.tuple(vec![Value::I64(1)]);
        assert_eq!(heap.display(&single).to_string(), "(1,)");

        let b = heap.bytes(&b"a'\x00"[..]);
        assert_eq!(heap.display(&b).to_string(), r"b'a\'\x00'");

        let empty = heap.set(vec![]).unwrap();
        assert_eq!(heap.display(&empty).to_string(), "set()");
        assert_eq!(heap.display(&Value::F64(f64::NAN)).to_string(), "nan");
    }

    #[test]
    fn display_recursive() {
        let mut heap = Heap::new();
        let list = heap.list(vec![]);
        let r = list.obj_ref().unwrap();
        if let Some(Object::List(items)) = heap.get_mut(r) {
            items.push(list.clone());
        }
        assert_eq!(heap.display(&list).to_string(), "[[...]]");
    }

    #[test]
    fn from_bigint_normalizes() {
        assert_eq!(Value::from_bigint(BigInt::from(5)), Value::I64(5));
        let big: BigInt = BigInt::from(i64::MAX) + 1;
        assert_eq!(Value::from_bigint(big.clone()), Value::Int(big));
    }

    #[test]
    fn dict_deduplicates_keys() {
        let mut heap = Heap::new();
        let k1 = heap.string("k");
        let k2 = heap.string("k");
        let dict = heap.dict(vec![(k1, Value::I64(1)), (k2, Value::I64(2))]).unwrap();
        match heap.deref(&dict) {
            Some(Object::Dict(d)) => {
                assert_eq!(d.len(), 1);
                let key = HashableValue::String("k".into());
                assert_eq!(d.get(&key), Some(&Value::I64(2)));
            }
            _ => panic!("not a dict"),
        }
    }

    #[test]
    fn numeric_keys_compare_equal() {
        let mut heap = Heap::new();
        let set = heap.set(vec![Value::I64(1), Value::Bool(true), Value::F64(1.0)]).unwrap();
        match heap.deref(&set) {
            Some(Object::Set(s)) => assert_eq!(s.len(), 1),
            _ => panic!("not a set"),
        }
    }

    #[test]
    fn unhashable() {
        let mut heap = Heap::new();
        let list = heap.list(vec![]);
        assert_eq!(heap.dict(vec![(list, Value::None)]).unwrap_err(),
                   ErrorCode::ValueNotHashable("list"));
        let obj = heap.opaque("Thing");
        assert!(heap.set(vec![obj]).is_ok());
    }

    #[test]
    fn equality_across_heaps() {
        let mut h1 = Heap::new();
        let mut h2 = Heap::new();
        let s1 = h1.string("x");
        let a = h1.list(vec![s1, Value::F64(f64::NAN)]);
        h2.opaque("filler");
        let s2 = h2.string("x");
        let b = h2.list(vec![s2, Value::F64(f64::NAN)]);
        assert!(h1.equal(&a, &h2, &b));
        let c = h2.tuple(vec![]);
        assert!(!h1.equal(&a, &h2, &c));
        assert!(h1.equal(&Value::I64(3), &h2, &Value::Int(BigInt::from(3))));
    }
}

mod ser_tests {
    use num_bigint::BigInt;
    use crate::{Heap, Object, Pickler, Reduction, SerOptions, Value, value_to_vec};
    use crate::error::{ErrorCode, ErrorKind};
    use super::{contains, dumps, loads};

    #[test]
    fn protocol_0() {
        let mut heap = Heap::new();
        assert_eq!(dumps(&heap, &Value::None, 0), b"N.");
        assert_eq!(dumps(&heap, &Value::I64(5), 0), b"I5\n.");
        assert_eq!(dumps(&heap, &Value::Bool(true), 0), b"I01\n.");
        assert_eq!(dumps(&heap, &Value::F64(1.5), 0), b"F1.5\n.");
        let big = Value::from_bigint(BigInt::from(u64::MAX) + 1);
        assert_eq!(dumps(&heap, &big, 0), b"L18446744073709551616L\n.");

        let list = heap.list(vec![Value::I64(1), Value::I64(2)]);
        assert_eq!(dumps(&heap, &list, 0), b"(lp0\nI1\naI2\na.");
        let s = heap.string("abc");
        assert_eq!(dumps(&heap, &s, 0), b"Vabc\np0\n.");
        let key = heap.string("a");
        let dict = heap.dict(vec![(key, Value::I64(1))]).unwrap();
        assert_eq!(dumps(&heap, &dict, 0), b"(dp0\nVa\np1\nI1\ns.");
    }

    #[test]
    fn protocol_2() {
        let mut heap = Heap::new();
        let tuple = heap.tuple(vec![Value::I64(1), Value::I64(2)]);
        assert_eq!(dumps(&heap, &tuple, 2), b"\x80\x02K\x01K\x02\x86q\x00.");
        let key = heap.string("a");
        let dict = heap.dict(vec![(key, Value::I64(1))]).unwrap();
        assert_eq!(dumps(&heap, &dict, 2), b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01K\x01s.");
        let big = Value::from_bigint(BigInt::from(u64::MAX) + 1);
        assert_eq!(dumps(&heap, &big, 2), b"\x80\x02\x8a\x09\0\0\0\0\0\0\0\0\x01.");
        assert_eq!(dumps(&heap, &Value::I64(-1), 2), b"\x80\x02J\xff\xff\xff\xff.");
        assert_eq!(dumps(&heap, &Value::Bool(true), 2), b"\x80\x02\x88.");
    }

    #[test]
    fn protocol_3_bytes() {
        let mut heap = Heap::new();
        let b = heap.bytes(&b"abc"[..]);
        assert_eq!(dumps(&heap, &b, 3), b"\x80\x03C\x03abcq\x00.");
    }

    #[test]
    fn protocol_4_framed() {
        let mut heap = Heap::new();
        assert_eq!(dumps(&heap, &Value::None, 4), b"\x80\x04N.");
        let list = heap.list(vec![Value::I64(1), Value::I64(2)]);
        assert_eq!(dumps(&heap, &list, 4), b"\x80\x04\x95\x09\0\0\0\0\0\0\0]\x94(K\x01K\x02e.");
        let s = heap.string("abc");
        assert_eq!(dumps(&heap, &s, 4), b"\x80\x04\x95\x07\0\0\0\0\0\0\0\x8c\x03abc\x94.");
        let key = heap.string("a");
        let dict = heap.dict(vec![(key, Value::I64(1))]).unwrap();
        assert_eq!(dumps(&heap, &dict, 4),
                   b"\x80\x04\x95\x0a\0\0\0\0\0\0\0}\x94\x8c\x01a\x94K\x01s.");
    }

    #[test]
    fn protocol_5_bytearray() {
        let mut heap = Heap::new();
        let b = heap.bytearray(&b"ab"[..]);
        assert_eq!(dumps(&heap, &b, 5),
                   b"\x80\x05\x95\x0d\0\0\0\0\0\0\0\x96\x02\0\0\0\0\0\0\0ab\x94.");
    }

    #[test]
    fn frames_split_large_output() {
        let mut heap = Heap::new();
        let items = (0..2000).map(|i| heap.string(format!("{:0100}", i))).collect();
        let list = heap.list(items);
        let data = dumps(&heap, &list, 4);

        let mut pos = 2;
        let mut frames = Vec::new();
        while pos < data.len() && data[pos] == 0x95 {
            let mut len = [0; 8];
            len.copy_from_slice(&data[pos + 1..pos + 9]);
            let len = u64::from_le_bytes(len) as usize;
            assert!(len >= 4);
            frames.push(len);
            pos += 9 + len;
        }
        assert!(frames.len() >= 2);
        for &len in &frames[..frames.len() - 1] {
            assert!(len >= 64 * 1024);
        }
        // whatever follows the last header is an elided short frame
        assert!(data.len() - pos < 4);
        assert_eq!(data.last(), Some(&b'.'));
    }

    #[test]
    fn large_payload_bypasses_frame() {
        let mut heap = Heap::new();
        let payload = vec![7u8; 100_000];
        let b = heap.bytes(payload.clone());
        let data = dumps(&heap, &b, 4);
        let mut expected = b"\x80\x04B".to_vec();
        expected.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        expected.extend_from_slice(&payload);
        expected.extend_from_slice(b"\x94.");
        assert_eq!(data, expected);
    }

    #[test]
    fn batching() {
        let mut heap = Heap::new();
        let list = heap.list(vec![Value::None; 2500]);
        let data = dumps(&heap, &list, 2);
        assert_eq!(data.iter().filter(|&&b| b == b'(').count(), 3);
        assert_eq!(data.iter().filter(|&&b| b == b'e').count(), 3);

        let list = heap.list(vec![Value::None; 2001]);
        let data = dumps(&heap, &list, 2);
        let mut expected = b"\x80\x02]q\x00(".to_vec();
        expected.extend(vec![b'N'; 1000]);
        expected.extend_from_slice(b"e(");
        expected.extend(vec![b'N'; 1000]);
        expected.extend_from_slice(b"eNa.");
        assert_eq!(data, expected);
    }

    #[test]
    fn batches_load_alike_at_every_protocol() {
        let mut heap = Heap::new();
        let items: Vec<Value> = (0..2501).map(Value::I64).collect();
        let entries = (0..2501).map(|i| (Value::I64(i), heap.string(i.to_string()))).collect();
        let list = heap.list(items.clone());
        let dict = heap.dict(entries).unwrap();
        let set = heap.set(items.clone()).unwrap();
        let frozen = heap.frozenset(items).unwrap();
        let all = heap.tuple(vec![list, dict, set, frozen]);

        let (text_heap, text) = loads(&dumps(&heap, &all, 0));
        assert!(heap.equal(&all, &text_heap, &text));
        for proto in 1..=5 {
            let (bin_heap, bin) = loads(&dumps(&heap, &all, proto));
            assert!(text_heap.equal(&text, &bin_heap, &bin), "protocol {}", proto);
        }
    }

    #[test]
    fn shared_objects_are_memoized() {
        let mut heap = Heap::new();
        let x = heap.string("s");
        let list = heap.list(vec![x.clone(), x]);
        assert_eq!(dumps(&heap, &list, 2), b"\x80\x02]q\x00(X\x01\x00\x00\x00sq\x01h\x01e.");
    }

    #[test]
    fn self_referencing_list() {
        let mut heap = Heap::new();
        let list = heap.list(vec![]);
        let r = list.obj_ref().unwrap();
        if let Some(Object::List(items)) = heap.get_mut(r) {
            items.push(list.clone());
        }
        assert_eq!(dumps(&heap, &list, 2), b"\x80\x02]q\x00h\x00a.");
    }

    #[test]
    fn fast_mode() {
        let mut heap = Heap::new();
        let x = heap.string("s");
        let list = heap.list(vec![x.clone(), x]);
        let data = value_to_vec(&heap, &list, SerOptions::new().proto(2).fast()).unwrap();
        assert_eq!(data, b"\x80\x02](X\x01\x00\x00\x00sX\x01\x00\x00\x00se.");

        let cyclic = heap.list(vec![]);
        let r = cyclic.obj_ref().unwrap();
        if let Some(Object::List(items)) = heap.get_mut(r) {
            items.push(cyclic.clone());
        }
        let err = value_to_vec(&heap, &cyclic, SerOptions::new().proto(2).fast()).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::CyclicStructure("list")));
    }

    #[test]
    fn fast_mode_frozenset_cycle() {
        let mut heap = Heap::new();
        let cls = heap.global("app", "Holder");
        let args = heap.tuple(vec![]);
        let holder = heap.reduced(Reduction::new(cls, args));
        let frozen = heap.frozenset(vec![holder.clone()]).unwrap();
        if let Some(Object::Reduced(red)) = heap.get_mut(holder.obj_ref().unwrap()) {
            red.state = Some(frozen.clone());
        }
        let options = SerOptions::new().proto(4).fast().recursion_limit(200);
        let err = value_to_vec(&heap, &frozen, options).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::CyclicStructure("frozenset")));
        assert_eq!(err.kind(), ErrorKind::CyclicStructure);
    }

    #[test]
    fn recursion_limit() {
        let mut heap = Heap::new();
        let mut list = Value::None;
        let mut tuple = Value::None;
        for _ in 0..990 {
            list = heap.list(vec![list]);
            tuple = heap.tuple(vec![tuple]);
        }
        for proto in 0..=5 {
            for value in &[&list, &tuple] {
                let (heap2, mut value2) = loads(&dumps(&heap, value, proto));
                let mut depth = 0;
                while let Some(Object::List(items)) | Some(Object::Tuple(items)) = heap2.deref(&value2) {
                    value2 = items[0].clone();
                    depth += 1;
                }
                assert_eq!(depth, 990, "protocol {}", proto);
                assert_eq!(value2, Value::None);
            }
        }

        for _ in 990..1100 {
            list = heap.list(vec![list]);
        }
        let err = value_to_vec(&heap, &list, SerOptions::new()).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::RecursionLimit));
        assert_eq!(err.kind(), ErrorKind::Overflow);
        let err = value_to_vec(&heap, &list, SerOptions::new().recursion_limit(10)).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::RecursionLimit));
        assert!(value_to_vec(&heap, &list, SerOptions::new().recursion_limit(1200)).is_ok());
    }

    #[test]
    fn unsupported_protocol() {
        let heap = Heap::new();
        let err = value_to_vec(&heap, &Value::None, SerOptions::new().proto(6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
        assert_eq!(dumps(&heap, &Value::None, -1), b"\x80\x05N.");
    }

    #[test]
    fn opaque_objects_fail() {
        let mut heap = Heap::new();
        let obj = heap.opaque("socket");
        let err = value_to_vec(&heap, &obj, SerOptions::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnpicklableType);
    }

    #[test]
    fn python2_names() {
        let mut heap = Heap::new();
        let set = heap.set(vec![Value::I64(1)]).unwrap();
        let data = dumps(&heap, &set, 2);
        assert!(contains(&data, b"c__builtin__\nset\n"));
        let data = value_to_vec(&heap, &set, SerOptions::new().proto(2).no_fix_imports()).unwrap();
        assert!(contains(&data, b"cbuiltins\nset\n"));
        let data = dumps(&heap, &set, 3);
        assert!(contains(&data, b"cbuiltins\nset\n"));
    }

    #[test]
    fn dotted_global_names() {
        let mut heap = Heap::new();
        let g = heap.global("mymod", "Outer.Inner");
        let data = dumps(&heap, &g, 2);
        assert!(contains(&data, b"c__builtin__\ngetattr\n"));
        assert!(contains(&data, b"cmymod\nOuter\n"));
        let data = dumps(&heap, &g, 4);
        assert!(contains(&data, b"\x8c\x0bOuter.Inner"));

        let bad = heap.global("mymod", "<locals>.f");
        let err = value_to_vec(&heap, &bad, SerOptions::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedGlobal);
    }

    #[test]
    fn memo_persists_between_dumps() {
        let mut heap = Heap::new();
        let x = heap.list(vec![]);
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(2)).unwrap();
        pickler.dump(&heap, &x).unwrap();
        pickler.dump(&heap, &x).unwrap();
        assert_eq!(pickler.get_bytes(), b"\x80\x02]q\x00.\x80\x02h\x00.");
        assert_eq!(pickler.memo().len(), 1);

        pickler.clear_memo();
        pickler.dump(&heap, &x).unwrap();
        assert!(pickler.get_bytes().ends_with(b"\x80\x02]q\x00."));
    }
}

mod de_tests {
    use std::io::Cursor;
    use crate::{DecodeErrors, DeOptions, Object, StringEncoding, Unpickler, value_from_iter,
                value_from_reader, value_from_slice};
    use crate::error::{ErrorCode, ErrorKind};
    use super::{load_error, loads, repr};

    #[test]
    fn simple_streams() {
        assert_eq!(repr(b"N."), "None");
        assert_eq!(repr(b"I5\n."), "5");
        assert_eq!(repr(b"I01\n."), "True");
        assert_eq!(repr(b"L18446744073709551616L\n."), "18446744073709551616");
        assert_eq!(repr(b"(lp0\nI1\naI2\na."), "[1, 2]");
        assert_eq!(repr(b"(dp0\nVa\np1\nI1\ns."), r#"{"a": 1}"#);
        assert_eq!(repr(b"\x80\x02K\x01K\x02\x86q\x00."), "(1, 2)");
        assert_eq!(repr(b"\x80\x02\x8a\x09\0\0\0\0\0\0\0\0\x01."), "18446744073709551616");
        assert_eq!(repr(b"\x80\x02\x8a\x01\xff."), "-1");
        assert_eq!(repr(b"\x80\x03C\x03abcq\x00."), "b'abc'");
        assert_eq!(repr(b"\x80\x04\x95\x0a\0\0\0\0\0\0\0}\x94\x8c\x01a\x94K\x01s."), r#"{"a": 1}"#);
        assert_eq!(repr(b"\x80\x05\x95\x0d\0\0\0\0\0\0\0\x96\x02\0\0\0\0\0\0\0ab\x94."),
                   "bytearray(b'ab')");
    }

    #[test]
    fn float_text() {
        assert_eq!(repr(b"F1.5\n."), "1.5");
        assert_eq!(repr(b"Finf\n."), "inf");
        assert_eq!(load_error(b"Fx\n."), ErrorCode::InvalidLiteral(b"x".to_vec()));
    }

    #[test]
    fn stop_leaves_extra_values() {
        assert_eq!(repr(b"\x80\x02K\x01K\x02."), "2");
    }

    #[test]
    fn stack_errors() {
        assert_eq!(load_error(b"(."), ErrorCode::UnexpectedMark);
        assert_eq!(load_error(b"0."), ErrorCode::StackUnderflow);
        assert_eq!(load_error(b"t."), ErrorCode::MarkNotFound);
        assert_eq!(load_error(b"(Na."), ErrorCode::UnexpectedMark);
        assert_eq!(load_error(b"N(N\x87."), ErrorCode::UnexpectedMark);
    }

    #[test]
    fn pop_removes_mark() {
        assert_eq!(repr(b"N(0."), "None");
        assert_eq!(repr(b"N(K\x011."), "None");
    }

    #[test]
    fn invalid_streams() {
        assert_eq!(load_error(b"\x80\x06N."), ErrorCode::UnsupportedProtocol(6));
        assert_eq!(load_error(b"\xff"), ErrorCode::InvalidLoadKey(0xff));
        assert_eq!(load_error(b""), ErrorCode::Truncated);
        assert_eq!(load_error(b"\x80\x02N"), ErrorCode::Truncated);
        assert_eq!(load_error(b"\x80\x02N.N"), ErrorCode::TrailingBytes);
        assert_eq!(load_error(b"\x80\x02\x8d\xff\xff\xff\xff\xff\xff\xff\xff"),
                   ErrorCode::Overflow("length exceeds the system's maximum size"));
        assert_eq!(load_error(b"T\xff\xff\xff\xff"), ErrorCode::NegativeLength("BINSTRING pickle"));
        assert_eq!(load_error(b"(K\x01d."), ErrorCode::OddItemCount("DICT"));
    }

    #[test]
    fn truncated_frame() {
        let full = b"\x80\x04\x95\x0a\0\0\0\0\0\0\0}\x94\x8c\x01a\x94K\x01s.";
        let err = value_from_slice(&full[..full.len() - 1], DeOptions::new()).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Truncated));
        assert_eq!(err.kind(), ErrorKind::Truncated);
    }

    #[test]
    fn read_past_frame() {
        assert_eq!(load_error(b"\x80\x04\x95\x02\0\0\0\0\0\0\0M\x01\x00."), ErrorCode::FrameExhausted);
    }

    #[test]
    fn memo() {
        assert_eq!(load_error(b"\x80\x02h\x05."), ErrorCode::MissingMemo(5));
        assert_eq!(load_error(b"g7\n."), ErrorCode::MissingMemo(7));
        assert_eq!(repr(b"\x80\x02Nr\xff\xff\xff\x7f0j\xff\xff\xff\x7f."), "None");
        assert_eq!(repr(b"\x80\x04K\x07\x940h\x00."), "7");
    }

    #[test]
    fn python2_strings() {
        assert_eq!(load_error(b"Sabc\n."), ErrorCode::InvalidLiteral(b"abc".to_vec()));
        assert_eq!(repr(b"S'abc'\np0\n."), r#""abc""#);
        assert_eq!(repr(b"S'a\\nb\\x41\\101'\n."), r#""a\nbAA""#);

        let data = b"\x80\x02U\x01\xe9.";
        assert_eq!(load_error(data), ErrorCode::StringDecode("ascii"));
        let load = |encoding| {
            let (heap, value) = value_from_slice(data, DeOptions::new().encoding(encoding)).unwrap();
            heap.display(&value).to_string()
        };
        assert_eq!(load(StringEncoding::Latin1), r#""é""#);
        assert_eq!(load(StringEncoding::Bytes), r"b'\xe9'");
        let err = value_from_slice(data, DeOptions::new().decode_strings()).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::StringDecode("utf-8")));
    }

    #[test]
    fn python2_string_errors() {
        let load = |data: &[u8], encoding, errors| {
            let options = DeOptions::new().encoding(encoding).errors(errors);
            let (heap, value) = value_from_slice(data, options).unwrap();
            heap.as_str(&value).unwrap().to_owned()
        };
        let data = b"\x80\x02U\x03a\xe9b.";
        assert_eq!(load(data, StringEncoding::Ascii, DecodeErrors::Replace), "a\u{fffd}b");
        assert_eq!(load(data, StringEncoding::Ascii, DecodeErrors::Ignore), "ab");
        assert_eq!(load(data, StringEncoding::Ascii, DecodeErrors::BackslashReplace), r"a\xe9b");
        assert_eq!(load(data, StringEncoding::Utf8, DecodeErrors::Replace), "a\u{fffd}b");
        assert_eq!(load(data, StringEncoding::Utf8, DecodeErrors::Ignore), "ab");

        // Every non-ASCII byte is replaced on its own, but a truncated UTF-8
        // sequence only once.
        let euro = b"\x80\x02U\x04a\xe2\x82\xac.";
        assert_eq!(load(euro, StringEncoding::Ascii, DecodeErrors::Replace), "a\u{fffd}\u{fffd}\u{fffd}");
        assert_eq!(load(euro, StringEncoding::Utf8, DecodeErrors::Strict), "a\u{20ac}");
        let cut = b"\x80\x02U\x03a\xe2\x82.";
        assert_eq!(load(cut, StringEncoding::Utf8, DecodeErrors::Replace), "a\u{fffd}");
        assert_eq!(load(cut, StringEncoding::Utf8, DecodeErrors::Ignore), "a");

        let options = DeOptions::new().errors(DecodeErrors::Ignore);
        assert!(value_from_slice(b"S'a\xe9'\n.", options.clone()).is_ok());
        // Python 3 strings are always strict.
        let err = value_from_slice(b"\x80\x02X\x01\x00\x00\x00\xff.", options).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::StringDecode("utf-8")));
    }

    #[test]
    fn unicode_text() {
        assert_eq!(repr(b"Vcaf\xe9\n."), r#""café""#);
        assert_eq!(repr(b"V\\u20ac\\U0001f600\n."), "\"\u{20ac}\u{1f600}\"");
        assert_eq!(repr(b"\x80\x02X\x02\x00\x00\x00\xc3\xa9."), r#""é""#);
        assert_eq!(load_error(b"\x80\x02X\x01\x00\x00\x00\xff."), ErrorCode::StringDecode("utf-8"));
    }

    #[test]
    fn python2_set() {
        assert_eq!(repr(b"c__builtin__\nset\np0\n((lp1\nI1\naI2\natp2\nRp3\n."), "{1, 2}");
        let (heap, value) = value_from_slice(b"c__builtin__\nset\np0\n((lp1\nI1\naI2\natp2\nRp3\n.",
                                             DeOptions::new().no_fix_imports()).unwrap();
        assert!(heap.display(&value).to_string().starts_with("<reduce __builtin__.set"));
    }

    #[test]
    fn python3_bytes_at_protocol_2() {
        let data = b"\x80\x02c_codecs\nencode\nq\x00X\x02\x00\x00\x00abq\x01\
                     X\x06\x00\x00\x00latin1q\x02\x86q\x03Rq\x04.";
        assert_eq!(repr(data), "b'ab'");
    }

    #[test]
    fn instances() {
        let data = b"\x80\x02c__main__\nPoint\nq\x00)\x81q\x01}q\x02X\x01\x00\x00\x00xq\x03K\x01sb.";
        assert_eq!(repr(data), r#"<reduce copyreg.__newobj__ (__main__.Point,) state={"x": 1}>"#);
        assert_eq!(repr(b"(I1\nimymod\nCls\n."), "<reduce mymod.Cls (1,)>");
        assert_eq!(repr(b"(cmymod\nCls\nI1\no."), "<reduce mymod.Cls (1,)>");
        assert_eq!(repr(b"\x80\x04cmymod\nCls\n)}\x92."),
                   "<reduce copyreg.__newobj_ex__ (mymod.Cls, (), {})>");
        assert_eq!(load_error(b"\x80\x04cmymod\nCls\n)N\x92."),
                   ErrorCode::InvalidStackTop("dict", "NoneType".into()));
    }

    #[test]
    fn stack_global() {
        assert_eq!(repr(b"\x80\x04\x8c\x05mymod\x8c\x03Cls\x93."), "mymod.Cls");
        assert_eq!(load_error(b"\x80\x04K\x01\x8c\x03Cls\x93."),
                   ErrorCode::MalformedGlobal("STACK_GLOBAL requires str".into()));
    }

    #[test]
    fn several_pickles_in_one_stream() {
        let data = b"\x80\x02]q\x00.\x80\x02h\x00.";
        let mut unpickler = Unpickler::new(&data[..]);
        let first = unpickler.load().unwrap();
        assert_eq!(unpickler.position(), 6);
        let second = unpickler.load().unwrap();
        assert_eq!(first, second);
        assert_eq!(unpickler.protocol(), 2);
        unpickler.end().unwrap();

        let mut unpickler = Unpickler::new(&data[..]);
        unpickler.load().unwrap();
        unpickler.clear_memo();
        let err = unpickler.load().unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::MissingMemo(0)));
    }

    #[test]
    fn other_readers() {
        let data = b"\x80\x02K\x2a.";
        let (heap, value) = value_from_reader(Cursor::new(&data[..]), DeOptions::new()).unwrap();
        assert_eq!(heap.display(&value).to_string(), "42");
        let (heap, value) = value_from_iter(data.iter().map(|&b| Ok(b)), DeOptions::new()).unwrap();
        assert_eq!(heap.display(&value).to_string(), "42");
    }

    #[test]
    fn readonly_buffer_on_bytearray() {
        let (heap, value) = loads(b"\x80\x05\x96\x02\0\0\0\0\0\0\0ab\x98.");
        match heap.deref(&value) {
            Some(Object::Buffer(buf)) => {
                assert!(buf.readonly);
                assert_eq!(buf.data, b"ab");
            }
            _ => panic!("expected a buffer"),
        }
        assert_eq!(repr(b"\x80\x05C\x02ab\x98."), "b'ab'");
        assert_eq!(load_error(b"\x80\x05K\x01\x98."), ErrorCode::InvalidStackTop("buffer", "int".into()));
    }

    #[test]
    fn protocol_hint() {
        assert!(Unpickler::with_options(&b""[..], DeOptions::new().protocol_hint(6)).is_err());
        let mut unpickler = Unpickler::with_options(&b"N."[..], DeOptions::new().protocol_hint(3)).unwrap();
        unpickler.load().unwrap();
        assert_eq!(unpickler.protocol(), 3);
    }
}

mod graph_tests {
    use crate::{Heap, Object, Value};
    use super::{dumps, loads};

    fn list_items(heap: &Heap, value: &Value) -> Vec<Value> {
        match heap.deref(value) {
            Some(Object::List(items)) => items.clone(),
            _ => panic!("not a list"),
        }
    }

    #[test]
    fn identity_is_preserved() {
        for proto in 0..=5 {
            let mut heap = Heap::new();
            let x = heap.string("shared");
            let list = heap.list(vec![x.clone(), x]);
            let (heap2, value) = loads(&dumps(&heap, &list, proto));
            let items = list_items(&heap2, &value);
            assert_eq!(items[0], items[1]);
            assert!(items[0].obj_ref().is_some());
        }
    }

    #[test]
    fn self_referencing_list() {
        for proto in 0..=5 {
            let mut heap = Heap::new();
            let list = heap.list(vec![]);
            let r = list.obj_ref().unwrap();
            if let Some(Object::List(items)) = heap.get_mut(r) {
                items.push(list.clone());
            }
            let (heap2, value) = loads(&dumps(&heap, &list, proto));
            assert_eq!(list_items(&heap2, &value), vec![value.clone()]);
            assert!(heap.equal(&list, &heap2, &value));
        }
    }

    #[test]
    fn tuple_recursing_through_list() {
        for proto in 0..=5 {
            let mut heap = Heap::new();
            let list = heap.list(vec![]);
            let tuple = heap.tuple(vec![list.clone()]);
            if let Some(Object::List(items)) = heap.get_mut(list.obj_ref().unwrap()) {
                items.push(tuple.clone());
            }
            let (heap2, value) = loads(&dumps(&heap, &tuple, proto));
            let inner = heap2.as_tuple(&value).expect("not a tuple")[0].clone();
            assert_eq!(list_items(&heap2, &inner), vec![value.clone()]);
        }
    }

    #[test]
    fn shared_dict_values() {
        let mut heap = Heap::new();
        let inner = heap.list(vec![Value::I64(1)]);
        let k1 = heap.string("a");
        let k2 = heap.string("b");
        let dict = heap.dict(vec![(k1, inner.clone()), (k2, inner)]).unwrap();
        let (heap2, value) = loads(&dumps(&heap, &dict, 2));
        match heap2.deref(&value) {
            Some(Object::Dict(d)) => assert_eq!(d.entries()[0].1, d.entries()[1].1),
            _ => panic!("not a dict"),
        }
    }
}

mod hook_tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use crate::{DefaultHooks, ExtensionRegistry, Heap, Object, PickleBuffer, PickleHooks,
                Pickler, Reduction, SerOptions, Unpickler, UnpickleHooks, Value, value_to_vec};
    use crate::error::{ErrorCode, ErrorKind};
    use super::{dumps, load_error, loads};

    #[test]
    fn persistent_ids() {
        let mut heap = Heap::new();
        let pid = heap.string("abc");
        let obj = heap.persistent_id(pid);
        assert_eq!(dumps(&heap, &obj, 0), b"Pabc\n.");
        let data = dumps(&heap, &obj, 2);
        assert_eq!(data, b"\x80\x02X\x03\x00\x00\x00abcq\x00Q.");

        let (heap2, value) = loads(&data);
        match heap2.deref(&value) {
            Some(Object::PersistentId(pid)) => assert_eq!(heap2.as_str(pid), Some("abc")),
            _ => panic!("not a persistent id"),
        }
        assert!(heap.equal(&obj, &heap2, &value));
        assert_eq!(load_error(b"P\xe9\n."), ErrorCode::StringDecode("ascii"));
    }

    #[test]
    fn text_persistent_ids_load_as_strings() {
        let mut heap = Heap::new();
        let obj = heap.persistent_id(Value::I64(42));
        assert_eq!(dumps(&heap, &obj, 0), b"P42\n.");
        let (heap2, value) = loads(b"P42\n.");
        match heap2.deref(&value) {
            Some(Object::PersistentId(pid)) => assert_eq!(heap2.as_str(pid), Some("42")),
            _ => panic!("not a persistent id"),
        }
        // Binary protocols keep the integer.
        let (heap2, value) = loads(&dumps(&heap, &obj, 1));
        assert!(heap.equal(&obj, &heap2, &value));
    }

    struct Loader;

    impl UnpickleHooks for Loader {
        fn persistent_load(&mut self, heap: &mut Heap, pid: Value) -> Result<Value, ErrorCode> {
            let text = format!("loaded {}", heap.as_str(&pid).unwrap_or("?"));
            Ok(heap.string(text))
        }
    }

    struct OpaqueIds;

    impl PickleHooks for OpaqueIds {
        fn persistent_id(&mut self, heap: &Heap, value: &Value) -> Result<Option<Value>, ErrorCode> {
            match heap.deref(value) {
                Some(Object::Opaque(_)) => Ok(Some(Value::I64(42))),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn custom_hooks() {
        let mut unpickler = Unpickler::new(&b"Pabc\n."[..]);
        unpickler.set_hooks(Box::new(Loader));
        let value = unpickler.load().unwrap();
        assert_eq!(unpickler.heap().as_str(&value), Some("loaded abc"));

        let mut heap = Heap::new();
        let obj = heap.opaque("Connection");
        let list = heap.list(vec![obj]);
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(0)).unwrap();
        pickler.set_hooks(Box::new(OpaqueIds));
        pickler.dump(&heap, &list).unwrap();
        assert_eq!(pickler.get_bytes(), b"(lp0\nP42\na.");
    }

    #[test]
    fn extension_codes() {
        let registry = ExtensionRegistry::shared();
        registry.add("mymod", "Cls", 0x1234).unwrap();
        assert!(registry.add("other", "Cls", 0x1234).is_err());
        assert!(registry.add("mymod", "Cls", 0).is_err());

        let mut heap = Heap::new();
        let cls = heap.global("mymod", "Cls");
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(2)).unwrap();
        pickler.set_registry(registry.clone());
        pickler.dump(&heap, &cls).unwrap();
        let data = pickler.into_inner();
        assert_eq!(data, b"\x80\x02\x83\x34\x12.");

        let mut unpickler = Unpickler::new(&data[..]);
        unpickler.set_registry(registry.clone());
        let value = unpickler.load().unwrap();
        assert_eq!(unpickler.heap().display(&value).to_string(), "mymod.Cls");

        let err = load_error(&data);
        assert_eq!(err, ErrorCode::ExtensionUnregistered(0x1234));
        assert_eq!(err.kind(), ErrorKind::ExtensionUnregistered);
        assert_eq!(load_error(b"\x80\x02\x82\x00."), ErrorCode::InvalidExtensionCode);

        // below protocol 2 the registry is not consulted
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(1)).unwrap();
        pickler.set_registry(registry.clone());
        pickler.dump(&heap, &cls).unwrap();
        assert_eq!(pickler.get_bytes(), b"cmymod\nCls\nq\x00.");

        registry.remove("mymod", "Cls", 0x1234).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn out_of_band_buffers() {
        let mut heap = Heap::new();
        let buf = heap.buffer(&b"payload"[..], true);
        let collected = Rc::new(RefCell::new(Vec::new()));
        let sink = collected.clone();
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(5)).unwrap();
        pickler.set_buffer_callback(move |b: &PickleBuffer| {
            sink.borrow_mut().push(b.clone());
            false
        }).unwrap();
        pickler.dump(&heap, &buf).unwrap();
        let data = pickler.into_inner();
        assert_eq!(data, b"\x80\x05\x97\x98.");
        assert_eq!(collected.borrow().len(), 1);

        let mut unpickler = Unpickler::new(&data[..]);
        unpickler.set_buffers(collected.borrow().iter().cloned());
        let value = unpickler.load().unwrap();
        match unpickler.heap().deref(&value) {
            Some(Object::Buffer(b)) => assert_eq!(*b, PickleBuffer { data: b"payload".to_vec(), readonly: true }),
            _ => panic!("not a buffer"),
        }

        assert!(matches!(load_error(&data), ErrorCode::MissingBuffer(_)));
        let mut unpickler = Unpickler::new(&data[..]);
        unpickler.set_buffers(vec![]);
        let err = unpickler.load().unwrap_err();
        assert!(matches!(err.code(), Some(ErrorCode::MissingBuffer(_))));
    }

    #[test]
    fn in_band_buffers() {
        let mut heap = Heap::new();
        let ro = heap.buffer(&b"ro"[..], true);
        let rw = heap.buffer(&b"rw"[..], false);
        let list = heap.list(vec![ro, rw]);
        let (heap2, value) = loads(&dumps(&heap, &list, 5));
        assert_eq!(heap2.display(&value).to_string(), "[b'ro', bytearray(b'rw')]");

        let err = value_to_vec(&heap, &list, SerOptions::new().proto(4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnpicklableType);
        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(4)).unwrap();
        assert!(pickler.set_buffer_callback(|_| true).is_err());
    }

    #[test]
    fn reducer_override() {
        let mut heap = Heap::new();
        let callable = heap.global("mymod", "make");
        let arg = heap.string("x");
        let args = heap.tuple(vec![arg]);
        let obj = heap.opaque("Thing");

        let mut pickler = Pickler::with_options(Vec::new(), SerOptions::new().proto(2)).unwrap();
        pickler.set_reducer_override(move |heap, obj| match heap.get(obj) {
            Some(Object::Opaque(_)) => Ok(Some(Reduction::new(callable.clone(), args.clone()))),
            _ => Ok(None),
        });
        pickler.dump(&heap, &obj).unwrap();
        let (heap2, value) = loads(pickler.get_bytes());
        assert_eq!(heap2.display(&value).to_string(), r#"<reduce mymod.make ("x",)>"#);

        // the override only applies to one dump
        pickler.clear_memo();
        let err = pickler.dump(&heap, &obj).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnpicklableType);
    }

    #[test]
    fn reduced_objects_roundtrip() {
        let data = b"\x80\x02c__main__\nPoint\nq\x00)\x81q\x01}q\x02X\x01\x00\x00\x00xq\x03K\x01sb.";
        let (heap, value) = loads(data);
        for proto in 2..=5 {
            let again = dumps(&heap, &value, proto);
            assert!(again.contains(&0x81));
            let (heap2, value2) = loads(&again);
            assert!(heap.equal(&value, &heap2, &value2));
        }
        let (heap2, value2) = loads(&dumps(&heap, &value, 0));
        assert!(heap.equal(&value, &heap2, &value2));
    }

    #[test]
    fn default_hooks_validate_names() {
        let mut heap = Heap::new();
        let mut hooks = DefaultHooks;
        assert!(hooks.find_class(&mut heap, "mod", "a.b").is_ok());
        assert!(hooks.find_class(&mut heap, "mod", "a..b").is_err());
        assert!(hooks.find_class(&mut heap, "", "a").is_err());
    }
}

mod roundtrip_tests {
    use rand::{RngCore, thread_rng};
    use quickcheck::{QuickCheck, StdGen};
    use serde::de::DeserializeSeed;
    use crate::{DeOptions, Heap, HeapSeed, Object, SerOptions, Value, value_from_slice, value_to_vec};
    use super::arby::Tree;

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill_bytes(&mut stream);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(value_from_slice(&stream, DeOptions::new()).is_err());
        }
    }

    #[test]
    fn fuzzing_short() {
        for _ in 0..5000 {
            let mut stream = [0u8; 12];
            thread_rng().fill_bytes(&mut stream);
            if value_from_slice(&stream, DeOptions::new()).is_ok() {
                assert_eq!(stream.last(), Some(&b'.'));
            }
        }
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip(tree: Tree) {
            let mut heap = Heap::new();
            let original = tree.build(&mut heap);
            for proto in 0..=5 {
                let vec = value_to_vec(&heap, &original, SerOptions::new().proto(proto)).unwrap();
                let (heap2, tripped) = value_from_slice(&vec, DeOptions::new()).unwrap();
                assert!(heap.equal(&original, &heap2, &tripped),
                        "protocol {}: {} != {}", proto, heap.display(&original), heap2.display(&tripped));
            }
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(1000)
                         .quickcheck(roundtrip as fn(_));
    }

    #[test]
    fn roundtrip_json() {
        let json = r#"[{"null":null,"false":false,"true":true,"int":-1238571,"float":1.5e10,"list":[false,5,"true",3.8]}]"#;
        let mut heap = Heap::new();
        let mut de = serde_json::Deserializer::from_str(json);
        let value = HeapSeed::new(&mut heap).deserialize(&mut de).unwrap();
        let original: serde_json::Value = serde_json::from_str(json).unwrap();

        for proto in 0..=5 {
            let vec = value_to_vec(&heap, &value, SerOptions::new().proto(proto)).unwrap();
            let (heap2, tripped) = value_from_slice(&vec, DeOptions::new()).unwrap();
            let back = serde_json::to_value(heap2.serializable(&tripped)).unwrap();
            assert_eq!(back, original);
        }
    }

    #[test]
    fn json_rejects_recursion() {
        let mut heap = Heap::new();
        let list = heap.list(vec![]);
        if let Some(Object::List(items)) = heap.get_mut(list.obj_ref().unwrap()) {
            items.push(list.clone());
        }
        assert!(serde_json::to_string(&heap.serializable(&list)).is_err());

        let opaque = heap.opaque("Thing");
        assert!(serde_json::to_string(&heap.serializable(&opaque)).is_err());
        assert_eq!(serde_json::to_string(&heap.serializable(&Value::None)).unwrap(), "null");
    }
}

mod component_tests {
    use crate::{Heap, MemoArray, MemoTable, ObjRef, Value};
    use crate::compat::{to_python2, to_python3};
    use crate::cursor::BufferCursor;
    use crate::error::ErrorCode;
    use crate::stack::OperandStack;

    fn handles(n: usize) -> Vec<ObjRef> {
        let mut heap = Heap::new();
        (0..n).map(|_| heap.list(vec![]).obj_ref().unwrap()).collect()
    }

    #[test]
    fn memo_table() {
        let refs = handles(100);
        let mut memo = MemoTable::new();
        for (i, &r) in refs.iter().enumerate() {
            memo.set(r, i as u32).unwrap();
        }
        assert_eq!(memo.len(), 100);
        assert!(memo.capacity() >= 200);
        assert_eq!(memo.get(refs[42]), Some(42));

        let snapshot = memo.copy();
        memo.set(refs[42], 7).unwrap();
        assert_eq!(snapshot.get(refs[42]), Some(42));
        assert_eq!(memo.get(refs[42]), Some(7));
        assert_eq!(memo.len(), 100);

        memo.clear();
        assert!(memo.is_empty());
        assert_eq!(memo.get(refs[0]), None);
        assert_eq!(snapshot.iter().count(), 100);
    }

    #[test]
    fn memo_array() {
        let mut memo = MemoArray::new();
        memo.set(3, Value::I64(3)).unwrap();
        memo.set(5_000_000, Value::I64(5)).unwrap();
        assert_eq!(memo.get(3), Ok(&Value::I64(3)));
        assert_eq!(memo.get(5_000_000), Ok(&Value::I64(5)));
        assert_eq!(memo.get(4), Err(ErrorCode::MissingMemo(4)));
        assert_eq!(memo.get(100_000), Err(ErrorCode::MissingMemo(100_000)));
        assert_eq!(memo.len(), 2);
        memo.set(3, Value::None).unwrap();
        assert_eq!(memo.len(), 2);
        memo.clear();
        assert!(memo.is_empty());
    }

    #[test]
    fn stack_marks() {
        let mut stack = OperandStack::new();
        stack.push(Value::I64(1));
        stack.mark();
        assert_eq!(stack.pop(), Err(ErrorCode::UnexpectedMark));
        stack.push(Value::I64(2));
        stack.push(Value::I64(3));
        assert_eq!(stack.fence(), 1);
        let mark = stack.pop_mark().unwrap();
        assert_eq!(stack.drain_from(mark).unwrap(), vec![Value::I64(2), Value::I64(3)]);
        assert!(!stack.mark_present());
        assert_eq!(stack.pop(), Ok(Value::I64(1)));
        assert_eq!(stack.pop(), Err(ErrorCode::StackUnderflow));
        assert_eq!(stack.pop_mark(), Err(ErrorCode::MarkNotFound));
    }

    #[test]
    fn stack_builds_containers() {
        let mut heap = Heap::new();
        let mut stack = OperandStack::new();
        stack.mark();
        stack.push(Value::I64(1));
        stack.push(Value::I64(2));
        let mark = stack.pop_mark().unwrap();
        stack.pop_tuple(&mut heap, mark).unwrap();
        let tuple = stack.pop().unwrap();
        assert_eq!(heap.display(&tuple).to_string(), "(1, 2)");
        assert!(stack.is_empty());
    }

    #[test]
    fn cursor_reads() {
        let mut cursor = BufferCursor::new(&b"ab\ncd\x01\x00"[..]);
        assert_eq!(cursor.read_line(), Some(&b"ab"[..]));
        assert_eq!(cursor.read_bytes(2).unwrap(), b"cd");
        assert_eq!(cursor.read_u16_le().unwrap(), 1);
        assert!(cursor.is_exhausted());
        assert!(cursor.read_u8().is_err());
        assert_eq!(cursor.read_line(), None);
        cursor.retreat(2).unwrap();
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn cursor_writes() {
        let mut buf = vec![0u8; 12];
        let mut cursor = BufferCursor::new(&mut buf[..]);
        cursor.write_u8(9).unwrap();
        cursor.write_u32_le(0x0403_0201).unwrap();
        assert!(cursor.write_u64_le(0).is_err());
        cursor.shift(1, 4).unwrap();
        assert_eq!(cursor.offset(), 9);
        assert_eq!(&buf[..9], &[9, 1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn compat_names() {
        let pair = |m: &str, n: &str| (m.to_owned(), n.to_owned());
        assert_eq!(to_python3("__builtin__", "set"), pair("builtins", "set"));
        assert_eq!(to_python3("__builtin__", "xrange"), pair("builtins", "range"));
        assert_eq!(to_python3("exceptions", "ValueError"), pair("builtins", "ValueError"));
        assert_eq!(to_python3("cStringIO", "StringIO"), pair("io", "StringIO"));
        assert_eq!(to_python2("builtins", "range"), pair("__builtin__", "xrange"));
        assert_eq!(to_python2("builtins", "ValueError"), pair("exceptions", "ValueError"));
        assert_eq!(to_python2("io", "StringIO"), pair("io", "StringIO"));
        assert_eq!(to_python2("mymod", "Cls"), pair("mymod", "Cls"));
    }
}
