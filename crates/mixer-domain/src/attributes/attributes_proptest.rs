//! Property-based tests for attribute sets and fingerprints.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::time::{Duration, UNIX_EPOCH};

    use crate::attributes::{AttributeValue, Attributes};

    /// Strategy generating one value of every variant.
    fn value_strategy() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            "[a-z0-9/._-]{0,16}".prop_map(AttributeValue::String),
            any::<i64>().prop_map(AttributeValue::Int64),
            any::<f64>().prop_map(AttributeValue::Double),
            any::<bool>().prop_map(AttributeValue::Bool),
            (0u64..4_000_000_000).prop_map(|secs| AttributeValue::Timestamp(
                UNIX_EPOCH + Duration::from_secs(secs)
            )),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(AttributeValue::Bytes),
        ]
    }

    /// Strategy generating unique (name, value) pairs.
    fn entries_strategy() -> impl Strategy<Value = Vec<(String, AttributeValue)>> {
        prop::collection::btree_map("[a-z]{1,6}(\\.[a-z]{1,6})?", value_strategy(), 0..12)
            .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn test_fingerprint_is_insertion_order_independent(
            entries in entries_strategy(),
            seed in any::<u64>()
        ) {
            let forward: Attributes = entries.iter().cloned().collect();

            // Deterministic shuffle driven by the seed
            let mut shuffled = entries.clone();
            let len = shuffled.len();
            if len > 1 {
                let mut state = seed;
                for i in (1..len).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (state >> 33) as usize % (i + 1);
                    shuffled.swap(i, j);
                }
            }
            let mut reordered = Attributes::new();
            for (name, value) in shuffled {
                reordered.insert(name, value);
            }

            prop_assert_eq!(forward.fingerprint(), reordered.fingerprint());
        }

        #[test]
        fn test_only_empty_set_has_empty_fingerprint(entries in entries_strategy()) {
            let attributes: Attributes = entries.into_iter().collect();
            prop_assert_eq!(attributes.fingerprint().is_empty(), attributes.is_empty());
        }

        #[test]
        fn test_applying_delta_reconstructs_current(
            base in entries_strategy(),
            current in entries_strategy()
        ) {
            let base: Attributes = base.into_iter().collect();
            let current: Attributes = current.into_iter().collect();

            let update = current.delta_from(&base);
            let mut rebuilt = base.clone();
            for name in &update.removed {
                rebuilt.remove(name);
            }
            for (name, value) in &update.changed {
                rebuilt.insert(name.clone(), value.clone());
            }

            prop_assert_eq!(rebuilt.fingerprint(), current.fingerprint());
        }
    }
}
