//! 编解码往返性质测试
//!
//! 对所有内置字段：在可表示范围内，decode(encode(v)) 与 v 的误差不超过 scale/2；
//! 未提供的字段保持哨兵值并解码为 NotAvailable。

use busview_protocol::{CodecRegistry, FieldValue, J1939Id};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// 所有内置 (pgn, field_key) 组合
fn builtin_fields() -> Vec<(u32, String)> {
    CodecRegistry::builtin()
        .definitions()
        .flat_map(|def| def.fields.iter().map(move |f| (def.pgn, f.key.clone())))
        .collect()
}

proptest! {
    #[test]
    fn prop_roundtrip_within_half_lsb(
        index in 0usize..64,
        fraction in 0.0f64..=1.0,
        sa in any::<u8>(),
    ) {
        let registry = CodecRegistry::builtin();
        let fields = builtin_fields();
        let (pgn, key) = &fields[index % fields.len()];
        let field = registry.get(*pgn).unwrap().field(key).unwrap().clone();

        let value = field.min_value() + fraction * (field.max_value() - field.min_value());
        let payload = registry
            .encode(*pgn, &BTreeMap::from([(key.clone(), value)]))
            .unwrap();

        let id = J1939Id::compose(6, *pgn, sa).raw();
        let decoded = registry.decode(id, &payload).unwrap();
        let got = decoded.fields[key].value().unwrap();

        let tolerance = field.scale / 2.0 + 1e-9 * value.abs().max(1.0);
        prop_assert!((got - value).abs() <= tolerance, "{} -> {} (tol {})", value, got, tolerance);
        prop_assert_eq!(decoded.source_address, sa);

        // 其余字段保持不可用
        for other in registry.get(*pgn).unwrap().fields.iter().filter(|f| &f.key != key) {
            prop_assert_eq!(decoded.fields[&other.key], FieldValue::NotAvailable);
        }
    }

    #[test]
    fn prop_available_bytes_survive_decode_encode(payload in any::<[u8; 8]>()) {
        let registry = CodecRegistry::builtin();
        for def in registry.definitions() {
            let id = J1939Id::compose(6, def.pgn, 0).raw();
            let decoded = registry.decode(id, &payload).unwrap();
            let values: BTreeMap<String, f64> = decoded
                .fields
                .iter()
                .filter_map(|(k, v)| v.value().map(|v| (k.clone(), v)))
                .collect();
            let reencoded = registry.encode(def.pgn, &values).unwrap();

            for field in &def.fields {
                let range = field.byte_offset..field.byte_offset + field.width.bytes();
                if decoded.fields[&field.key].is_available() {
                    prop_assert_eq!(&reencoded[range.clone()], &payload[range]);
                } else {
                    prop_assert!(reencoded[range].iter().all(|b| *b == 0xFF));
                }
            }
        }
    }
}

#[test]
fn test_empty_request_is_all_sentinel() {
    let registry = CodecRegistry::builtin();
    for def in registry.definitions() {
        let payload = registry.encode(def.pgn, &BTreeMap::new()).unwrap();
        assert_eq!(payload, [0xFF; 8]);
        let decoded = registry.decode(J1939Id::compose(6, def.pgn, 0).raw(), &payload).unwrap();
        assert!(decoded.fields.values().all(|v| *v == FieldValue::NotAvailable));
    }
}

#[test]
fn test_decode_by_name_and_number_agree() {
    let registry = CodecRegistry::builtin();
    let values = BTreeMap::from([("oil_temp".to_string(), 90.0)]);
    let by_number = registry.encode(65262u32, &values).unwrap();
    let by_name = registry.encode("temps", &values).unwrap();
    assert_eq!(by_number, by_name);
    assert_eq!(&by_number[2..4], &[0x60, 0x2D]);
}
