use proptest::prelude::*;
use trellis_core::merge::{MergeContext, merge};
use trellis_core::model::{Field, Status, Strategy as MergeStrategy};

#[path = "generators.rs"]
mod generators;
use generators::*;

fn ctx() -> MergeContext {
    MergeContext::at(created_at() + chrono::Duration::days(30))
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(1000))]

    #[test]
    fn merged_record_is_independent_of_side_order((base, a, b) in arb_fork()) {
        let ab = merge(Some(&base), &a, &b, &ctx());
        let ba = merge(Some(&base), &b, &a, &ctx());
        prop_assert_eq!(&ab.merged, &ba.merged);
        prop_assert_eq!(ab.conflicts.len(), ba.conflicts.len());
    }

    #[test]
    fn merging_a_record_with_itself_changes_nothing((base, a, _b) in arb_fork()) {
        let out = merge(Some(&base), &a, &a, &ctx());
        prop_assert_eq!(out.merged, a);
        prop_assert!(out.conflicts.is_empty());
    }

    #[test]
    fn unchanged_side_yields_the_other((base, a, _b) in arb_fork()) {
        let out = merge(Some(&base), &base, &a, &ctx());
        prop_assert_eq!(&out.merged, &a);
        let out = merge(Some(&base), &a, &base, &ctx());
        prop_assert_eq!(&out.merged, &a);
    }

    #[test]
    fn merge_result_absorbs_both_inputs((base, a, b) in arb_fork()) {
        let first = merge(Some(&base), &a, &b, &ctx()).merged;
        // Merging either input again, with it as the ancestor, is a no-op.
        prop_assert_eq!(&merge(Some(&a), &first, &a, &ctx()).merged, &first);
        prop_assert_eq!(&merge(Some(&b), &b, &first, &ctx()).merged, &first);
    }

    #[test]
    fn version_never_goes_backwards((base, a, b) in arb_fork()) {
        let out = merge(Some(&base), &a, &b, &ctx());
        prop_assert!(out.merged.version >= a.version.max(b.version));
        prop_assert!(out.merged.updated_at >= a.updated_at.max(b.updated_at));
    }

    #[test]
    fn labels_kept_by_both_sides_survive((base, a, b) in arb_fork()) {
        let out = merge(Some(&base), &a, &b, &ctx());
        for label in a.labels.intersection(&b.labels) {
            prop_assert!(out.merged.labels.contains(label));
        }
    }

    #[test]
    fn every_remnant_records_the_winning_value((base, a, b) in arb_fork()) {
        let out = merge(Some(&base), &a, &b, &ctx());
        for remnant in &out.conflicts {
            let field = remnant.target().unwrap();
            prop_assert_eq!(&remnant.won_value, &field.value(&out.merged));
            prop_assert_ne!(&remnant.won_value, &remnant.lost_value);
        }
    }

    #[test]
    fn close_time_is_set_exactly_when_closed((base, a, b) in arb_fork()) {
        for out in [merge(Some(&base), &a, &b, &ctx()), merge(None, &a, &b, &ctx())] {
            let merged = &out.merged;
            prop_assert_eq!(
                merged.closed_at.is_some(),
                merged.status == Status::Closed,
                "status {:?} with closed_at {:?}",
                merged.status,
                merged.closed_at
            );
        }
    }

    #[test]
    fn identity_fields_come_from_the_ancestor((base, a, b) in arb_fork()) {
        let out = merge(Some(&base), &a, &b, &ctx());
        for field in [Field::Id, Field::CreatedAt, Field::CreatedBy] {
            prop_assert_eq!(field.value(&out.merged), field.value(&base));
        }
    }

    #[test]
    fn missing_base_with_same_origin_still_converges((_base, a, b) in arb_fork()) {
        let ab = merge(None, &a, &b, &ctx());
        let ba = merge(None, &b, &a, &ctx());
        prop_assert_eq!(ab.merged, ba.merged);
        prop_assert!(ab.conflicts.iter().all(|r| !r.is_whole_record()));
    }

    #[test]
    fn lww_fields_do_not_depend_on_pairing_order((base, a, b, c) in arb_three_way()) {
        let ctx = ctx();
        let ab = merge(Some(&base), &a, &b, &ctx).merged;
        let left = merge(Some(&base), &ab, &c, &ctx).merged;
        let bc = merge(Some(&base), &b, &c, &ctx).merged;
        let right = merge(Some(&base), &a, &bc, &ctx).merged;
        for field in Field::ALL.into_iter().filter(|f| f.strategy() == MergeStrategy::Lww) {
            prop_assert_eq!(field.value(&left), field.value(&right), "field {}", field);
            prop_assert_eq!(left.stamp(field), right.stamp(field), "stamp of {}", field);
        }
    }
}
