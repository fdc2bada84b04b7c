//! Property tests for the fragment algebra and snapshot merge.
//!
//! 1. Applying `diff(new, old)` to the state built from `old` yields the
//!    state built from `new`.
//! 2. Re-applying an unchanged fragment is a no-op.
//! 3. Removing a fragment (`diff(&[], old)`) empties its state.
//! 4. `apply` never mutates its input snapshot.
//! 5. `merge` is associative when no array leaves are involved.

use proptest::prelude::*;
use serde_json::{json, Map};

use stardust::fragment::{diff, flatten};
use stardust::{AppState, FragmentDelta, Value};

// ── Strategies ───────────────────────────────────────────────────────

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-z]{0,4}".prop_map(Value::from),
    ]
}

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        arb_scalar(),
        proptest::collection::vec(any::<u8>(), 0..3).prop_map(|v| json!(v)),
    ]
}

fn arb_object(inner: impl Strategy<Value = Value>) -> impl Strategy<Value = Value> {
    proptest::collection::btree_map("[a-d]", inner, 0..4).prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}

fn arb_fragment() -> impl Strategy<Value = Value> {
    let tree = arb_leaf().prop_recursive(3, 24, 4, arb_object);
    arb_object(tree)
}

/// Deltas without array leaves; arrays concatenate on merge.
fn arb_scalar_delta() -> impl Strategy<Value = FragmentDelta> {
    let fragment = || arb_object(arb_scalar().prop_recursive(3, 24, 4, arb_object));
    (fragment(), fragment()).prop_map(|(new, old)| diff(&flatten(&new), &flatten(&old)))
}

// ═════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn diff_then_apply_reaches_the_new_state(old in arb_fragment(), new in arb_fragment()) {
        let from = AppState::from_value(&old);
        let delta = diff(&flatten(&new), &flatten(&old));
        prop_assert_eq!(from.apply(&delta), AppState::from_value(&new));
    }

    #[test]
    fn unchanged_fragment_is_idempotent(fragment in arb_fragment()) {
        let flat = flatten(&fragment);
        let state = AppState::from_value(&fragment);
        let delta = diff(&flat, &flat);
        prop_assert!(delta.unset.is_empty());
        prop_assert_eq!(state.apply(&delta), state);
    }

    #[test]
    fn removing_a_fragment_empties_its_state(fragment in arb_fragment()) {
        let delta = diff(&[], &flatten(&fragment));
        prop_assert!(delta.set.is_empty());
        prop_assert!(AppState::from_value(&fragment).apply(&delta).is_empty());
    }

    #[test]
    fn apply_leaves_its_input_untouched(old in arb_fragment(), new in arb_fragment()) {
        let before = AppState::from_value(&old);
        let snapshot = before.clone();
        let _ = before.apply(&diff(&flatten(&new), &flatten(&old)));
        prop_assert_eq!(before, snapshot);
    }

    #[test]
    fn merge_is_associative_without_arrays(a in arb_scalar_delta(), b in arb_scalar_delta(), c in arb_scalar_delta()) {
        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        prop_assert_eq!(left, right);
    }
}

// ── Examples ─────────────────────────────────────────────────────────

#[test]
fn merge_concatenates_arrays_in_call_order() {
    let first = FragmentDelta::new().with_set("list", json!([1, 2])).with_set("name", json!("a"));
    let second = FragmentDelta::new().with_set("list", json!([3])).with_set("name", json!("b"));

    let merged = first.merge(second);
    assert_eq!(merged.set["list"], json!([1, 2, 3]));
    assert_eq!(merged.set["name"], json!("b"));
}

#[test]
fn login_fragment_round_trip() {
    let fragment = json!({"page": "login"});
    let added = diff(&flatten(&fragment), &[]);
    assert_eq!(added, FragmentDelta::new().with_set("page", json!("login")));

    let removed = diff(&[], &flatten(&fragment));
    assert_eq!(removed, FragmentDelta::new().with_unset("page"));
}
