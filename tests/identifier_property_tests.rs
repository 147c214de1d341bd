//! 仲裁 ID 编解码的性质测试

use fps_sdk::protocol::{IdentifierFields, IdentifierLayout};
use proptest::prelude::*;

proptest! {
    /// 全域往返：decode(encode(t)) == t
    #[test]
    fn identifier_round_trip(
        positioner_id in 0u16..2048,
        command_id in 0u8..=255,
        uid in 0u8..64,
        response_code in 0u8..16,
    ) {
        let layout = IdentifierLayout::default();
        let encoded = layout.encode(positioner_id, command_id, uid, response_code);

        // 29 位以内
        prop_assert!(encoded < (1 << 29));

        let fields = layout.decode(encoded);
        prop_assert_eq!(fields, IdentifierFields {
            positioner_id,
            command_id,
            uid,
            response_code,
        });
    }

    /// 编码是单射：不同字段组合给出不同 ID
    #[test]
    fn identifier_is_injective(
        a in (0u16..2048, 0u8..=255u8, 0u8..64, 0u8..16),
        b in (0u16..2048, 0u8..=255u8, 0u8..64, 0u8..16),
    ) {
        let layout = IdentifierLayout::default();
        let id_a = layout.encode(a.0, a.1, a.2, a.3);
        let id_b = layout.encode(b.0, b.1, b.2, b.3);
        if a != b {
            prop_assert_ne!(id_a, id_b);
        } else {
            prop_assert_eq!(id_a, id_b);
        }
    }

    /// 字段越界时按掩码截断，不会越过 29 位
    #[test]
    fn identifier_masks_out_of_range(positioner_id in 0u16..=u16::MAX, uid in 0u8..=u8::MAX) {
        let layout = IdentifierLayout::default();
        let encoded = layout.encode(positioner_id, 3, uid, 0);
        prop_assert!(encoded < (1 << 29));
    }
}
