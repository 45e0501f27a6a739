//! Table behavior: array/map split, length, iteration and tombstones

use std::collections::HashSet;

use ferrous_script::{ScriptResult, Table, Value};
use proptest::prelude::*;

fn walk(table: &Table) -> ScriptResult<Vec<(Value, Value)>> {
    let mut out = Vec::new();
    let mut key = Value::Nil;
    while let Some(pair) = table.next(&key)? {
        key = pair.key.clone();
        out.push((pair.key, pair.value));
    }
    Ok(out)
}

#[test]
fn test_length_of_sequence_built_out_of_order() -> ScriptResult<()> {
    let mut t = Table::new();
    t.set_int(3, Value::from(3.0))?;
    t.set_int(1, Value::from(1.0))?;
    t.set_int(2, Value::from(2.0))?;
    assert_eq!(t.length(), 3);
    t.set_int(2, Value::Nil)?;
    assert_eq!(t.length(), 1);
    Ok(())
}

#[test]
fn test_zero_based_origin() -> ScriptResult<()> {
    let mut t = Table::with_origin(0);
    t.set_int(0, Value::from("a"))?;
    t.set_int(1, Value::from("b"))?;
    assert_eq!(t.length(), 2);
    assert_eq!(t.get_int(0), Value::from("a"));
    Ok(())
}

#[test]
fn test_nil_and_nan_keys_are_rejected() {
    let mut t = Table::new();
    assert!(t.set(Value::Nil, Value::from(1.0)).is_err());
    assert!(t.set(Value::Number(f64::NAN), Value::from(1.0)).is_err());
    assert!(t.get(&Value::Nil).is_nil());
}

#[test]
fn test_negative_zero_is_zero() -> ScriptResult<()> {
    let mut t = Table::new();
    t.set(Value::Number(-0.0), Value::from("zero"))?;
    assert_eq!(t.get(&Value::Number(0.0)), Value::from("zero"));
    Ok(())
}

#[test]
fn test_clearing_current_key_during_iteration() -> ScriptResult<()> {
    let mut t = Table::new();
    for name in ["a", "b", "c", "d"] {
        t.set_str(name, Value::from(name));
    }
    let mut seen = Vec::new();
    let mut key = Value::Nil;
    while let Some(pair) = t.next(&key)? {
        seen.push(pair.key.to_string());
        // assigning nil to the current key must not break the traversal
        t.set(pair.key.clone(), Value::Nil)?;
        key = pair.key;
    }
    assert_eq!(seen, vec!["a", "b", "c", "d"]);
    assert_eq!(t.count(), 0);
    Ok(())
}

#[test]
fn test_clearing_array_keys_during_iteration() -> ScriptResult<()> {
    let mut t = Table::new();
    for n in 1..=3 {
        t.init_next_array_key(Value::from(n as f64))?;
    }
    t.set_str("a", Value::from(4.0));

    let mut seen = Vec::new();
    let mut key = Value::Nil;
    while let Some(pair) = t.next(&key)? {
        seen.push(pair.key.clone());
        t.set(pair.key.clone(), Value::Nil)?;
        key = pair.key;
    }
    assert_eq!(
        seen,
        vec![Value::from(1.0), Value::from(2.0), Value::from(3.0), Value::from("a")]
    );
    assert_eq!(t.count(), 0);
    assert_eq!(t.length(), 0);
    Ok(())
}

#[test]
fn test_append_fills_first_hole() -> ScriptResult<()> {
    let mut t = Table::new();
    t.init_next_array_key(Value::from(1.0))?;
    t.init_next_array_key(Value::Nil)?;
    t.init_next_array_key(Value::from(3.0))?;
    assert_eq!(t.length(), 1);

    t.append(Value::from("x"));
    assert_eq!(t.get_int(2), Value::from("x"));
    assert_eq!(t.length(), 3);
    let values: Vec<Value> = walk(&t)?.into_iter().map(|(_, v)| v).collect();
    assert_eq!(values, vec![Value::from(1.0), Value::from("x"), Value::from(3.0)]);
    Ok(())
}

#[test]
fn test_tombstones_swept_on_reinsert() -> ScriptResult<()> {
    let mut t = Table::new();
    t.set_str("x", Value::from(1.0));
    t.set_str("y", Value::from(2.0));
    t.set_str("x", Value::Nil);
    assert_eq!(t.map_len(), 2);
    // overwriting a live key does not sweep
    t.set_str("y", Value::from(3.0));
    assert_eq!(t.map_len(), 2);
    t.set_str("z", Value::from(4.0));
    assert_eq!(t.map_len(), 2);
    assert_eq!(t.count(), 2);
    Ok(())
}

#[test]
fn test_unknown_key_to_next() {
    let t = Table::new();
    assert!(t.next(&Value::from("missing")).is_err());
}

proptest! {
    #[test]
    fn prop_permuted_sequence_has_full_length(order in Just((1..=40i64).collect::<Vec<_>>()).prop_shuffle()) {
        let mut t = Table::new();
        for k in &order {
            t.set_int(*k, Value::Number(*k as f64)).unwrap();
        }
        prop_assert_eq!(t.length(), 40);
        for k in 1..=40i64 {
            prop_assert_eq!(t.get_int(k), Value::Number(k as f64));
        }
    }

    #[test]
    fn prop_iteration_visits_each_live_key_once(
        ints in proptest::collection::vec(-20i64..80, 0..60),
        strs in proptest::collection::vec("[a-f]{1,3}", 0..30),
        removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let mut t = Table::new();
        let mut keys: Vec<Value> = Vec::new();
        for k in &ints {
            t.set_int(*k, Value::Boolean(true)).unwrap();
            keys.push(Value::Number(*k as f64));
        }
        for s in &strs {
            t.set_str(s, Value::Boolean(true));
            keys.push(Value::from(s.as_str()));
        }
        if !keys.is_empty() {
            for idx in &removals {
                let key = idx.get(&keys).clone();
                t.set(key, Value::Nil).unwrap();
            }
        }

        let visited = walk(&t).unwrap();
        let unique: HashSet<String> = visited.iter().map(|(k, _)| format!("{:?}", k)).collect();
        prop_assert_eq!(unique.len(), visited.len());
        prop_assert_eq!(visited.len(), t.count());
        for (k, v) in &visited {
            prop_assert_eq!(&t.get(k), v);
        }
    }

    #[test]
    fn prop_length_is_a_border(values in proptest::collection::vec(proptest::option::of(0i32..5), 0..50)) {
        let mut t = Table::new();
        for (i, v) in values.iter().enumerate() {
            let value = v.map(|n| Value::Number(n as f64)).unwrap_or(Value::Nil);
            t.set_int(i as i64 + 1, value).unwrap();
        }
        let n = t.length() as i64;
        if n > 0 {
            prop_assert!(!t.get_int(n).is_nil());
        }
        prop_assert!(t.get_int(n + 1).is_nil());
    }

    #[test]
    fn prop_clearing_during_traversal_visits_each_key_once(
        ints in proptest::collection::vec(1i64..100, 0..60),
        strs in proptest::collection::vec("[a-f]{1,3}", 0..20),
        clears in proptest::collection::vec(any::<bool>(), 0..80),
    ) {
        let mut t = Table::new();
        for k in &ints {
            t.set_int(*k, Value::Number(*k as f64)).unwrap();
        }
        for s in &strs {
            t.set_str(s, Value::from(s.as_str()));
        }
        let live = t.count();

        let mut visited = Vec::new();
        let mut key = Value::Nil;
        let mut step = 0;
        while let Some(pair) = t.next(&key).unwrap() {
            if clears.get(step).copied().unwrap_or(false) {
                t.set(pair.key.clone(), Value::Nil).unwrap();
            }
            step += 1;
            visited.push(format!("{:?}", pair.key));
            key = pair.key;
        }
        let unique: HashSet<&String> = visited.iter().collect();
        prop_assert_eq!(unique.len(), visited.len());
        prop_assert_eq!(visited.len(), live);
    }

    #[test]
    fn prop_append_lands_at_length(values in proptest::collection::vec(proptest::option::of(0i32..5), 0..50)) {
        let mut t = Table::new();
        for v in &values {
            let value = v.map(|n| Value::Number(n as f64)).unwrap_or(Value::Nil);
            t.init_next_array_key(value).unwrap();
        }
        let before = t.length() as i64;
        t.append(Value::from("tail"));
        prop_assert_eq!(t.get_int(before + 1), Value::from("tail"));
        prop_assert!(t.length() as i64 > before);
    }
}
