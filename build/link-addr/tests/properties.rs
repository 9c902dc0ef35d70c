// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use link_addr::AddressPlan;
use proptest::prelude::*;

fn plan() -> impl Strategy<Value = AddressPlan> {
    (0u64..0x1_0000_0000, 1u64..0x100_0000, prop_oneof![Just(32u32), Just(64)])
        .prop_filter_map("base must fit the width", |(base, step, width)| {
            AddressPlan::new(base, step, width).ok()
        })
}

proptest::proptest! {
    #[test]
    fn slots_are_unique_increasing_and_disjoint(
        plan in plan(),
        count in 1usize..64,
    ) {
        let names: Vec<String> = (0..count).map(|i| format!("app{i:02}")).collect();
        let slots = match plan.assign(names) {
            Ok(slots) => slots,
            // Narrow widths may legitimately run out; that's covered below.
            Err(_) => return Ok(()),
        };
        prop_assert_eq!(slots.len(), count);
        for pair in slots.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(a.address() < b.address());
            prop_assert!(a.range.end <= b.range.start);
            prop_assert_eq!(a.range.end - a.range.start, plan.step());
        }
    }

    #[test]
    fn exhaustion_is_monotone(plan in plan(), ordinal in 0usize..0x1_0000) {
        if plan.range(ordinal).is_err() {
            prop_assert!(plan.range(ordinal + 1).is_err());
            prop_assert!(plan.range(ordinal + 1000).is_err());
        } else if ordinal > 0 {
            prop_assert!(plan.range(ordinal - 1).is_ok());
        }
    }

    #[test]
    fn assignment_is_deterministic(plan in plan(), count in 1usize..16) {
        let names: Vec<String> = (0..count).map(|i| format!("t{i}")).collect();
        prop_assert_eq!(plan.assign(names.clone()), plan.assign(names));
    }
}
