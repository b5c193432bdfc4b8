use std::collections::BTreeSet;

use chrono::NaiveDate;
use proptest::prelude::*;

use lotto_core::{evaluate, DrawNumbers, DrawRecord, PlayedSelection, MAX_NUMBER, MIN_NUMBER};

fn six_distinct() -> impl Strategy<Value = Vec<u8>> {
    proptest::sample::subsequence((MIN_NUMBER..=MAX_NUMBER).collect::<Vec<_>>(), 6)
        .prop_shuffle()
}

fn eval_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 6).unwrap()
}

fn mk_draw(numbers: Vec<u8>) -> DrawRecord {
    DrawRecord {
        id: 1,
        date: eval_date(),
        numbers: DrawNumbers::new(numbers).unwrap(),
    }
}

proptest! {
    #[test]
    fn hit_count_is_intersection_size(sel in six_distinct(), drawn in six_distinct()) {
        let selection = PlayedSelection::new(sel.clone(), eval_date()).unwrap();
        let result = evaluate(&selection, &mk_draw(drawn.clone()));

        let a: BTreeSet<u8> = sel.into_iter().collect();
        let b: BTreeSet<u8> = drawn.into_iter().collect();
        prop_assert_eq!(usize::from(result.hit_count), a.intersection(&b).count());
        prop_assert!(result.hit_count <= 6);
    }

    #[test]
    fn hit_count_ignores_number_order(
        sel in six_distinct(),
        drawn in six_distinct(),
        rot_a in 0usize..6,
        rot_b in 0usize..6,
    ) {
        let mut sel_rotated = sel.clone();
        sel_rotated.rotate_left(rot_a);
        let mut drawn_rotated = drawn.clone();
        drawn_rotated.rotate_left(rot_b);

        let base = evaluate(
            &PlayedSelection::new(sel, eval_date()).unwrap(),
            &mk_draw(drawn),
        );
        let permuted = evaluate(
            &PlayedSelection::new(sel_rotated, eval_date()).unwrap(),
            &mk_draw(drawn_rotated),
        );
        prop_assert_eq!(base, permuted);
    }

    #[test]
    fn hit_count_is_symmetric(a in six_distinct(), b in six_distinct()) {
        let ab = evaluate(&PlayedSelection::new(a.clone(), eval_date()).unwrap(), &mk_draw(b.clone()));
        let ba = evaluate(&PlayedSelection::new(b, eval_date()).unwrap(), &mk_draw(a));
        prop_assert_eq!(ab.hit_count, ba.hit_count);
    }
}
