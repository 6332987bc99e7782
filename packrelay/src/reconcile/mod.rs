//! Delta computation between a server's desired pack set and what a client
//! already has applied.
//!
//! [`calculate`] is a pure function; content-change detection (the same id
//! with different bytes) is the resolution cache's job, not this module's —
//! a pack present on both sides is always "already applied" here.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::PackDescriptor;

/// What has to change on a client before it matches the desired pack set.
///
/// `Normal` is never constructed with both sides empty; that case is
/// `NoOp`. `to_add` and `to_remove` never share an id.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Desired and applied already agree.
    NoOp,
    /// Nothing is desired; every known pack comes off.
    ClearAll,
    /// Apply these additions and removals, in order.
    Normal {
        /// Packs to add, in the desired set's application order.
        to_add: Vec<Arc<PackDescriptor>>,
        /// Ids to remove, in the applied set's order. Removal instructions
        /// need only ids, and an applied pack may be unknown to the catalog.
        to_remove: Vec<Uuid>,
    },
}

/// Compute the minimal add/remove delta.
///
/// Ordering within each side preserves the order of the sequence it was
/// filtered from; pack application order is observable to clients.
pub fn calculate(desired: &[Arc<PackDescriptor>], applied: &[Uuid]) -> Reconciliation {
    if desired.is_empty() {
        return Reconciliation::ClearAll;
    }

    let desired_ids: HashSet<Uuid> = desired.iter().map(|p| p.id()).collect();
    let applied_ids: HashSet<Uuid> = applied.iter().copied().collect();

    if desired_ids == applied_ids {
        return Reconciliation::NoOp;
    }

    let to_add = desired
        .iter()
        .filter(|pack| !applied_ids.contains(&pack.id()))
        .cloned()
        .collect();
    let to_remove = applied
        .iter()
        .filter(|id| !desired_ids.contains(id))
        .copied()
        .collect();

    Reconciliation::Normal { to_add, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PackSource;
    use proptest::prelude::*;

    fn descriptor(name: &str) -> Arc<PackDescriptor> {
        Arc::new(
            PackDescriptor::new(
                Uuid::new_v4(),
                name,
                PackSource::SelfHosted,
                format!("{name}.zip"),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_empty_desired_is_clear_all() {
        let applied = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(calculate(&[], &applied), Reconciliation::ClearAll);
        assert_eq!(calculate(&[], &[]), Reconciliation::ClearAll);
    }

    #[test]
    fn test_equal_sets_is_noop() {
        let a = descriptor("a");
        let b = descriptor("b");
        // Order differs; set equality is what counts.
        let applied = vec![b.id(), a.id()];
        assert_eq!(
            calculate(&[a.clone(), b.clone()], &applied),
            Reconciliation::NoOp
        );
    }

    #[test]
    fn test_partial_overlap_adds_missing_only() {
        // Server wants [A, B], client already has [B].
        let a = descriptor("a");
        let b = descriptor("b");
        let result = calculate(&[a.clone(), b.clone()], &[b.id()]);
        assert_eq!(
            result,
            Reconciliation::Normal {
                to_add: vec![a],
                to_remove: vec![],
            }
        );
    }

    #[test]
    fn test_stale_pack_is_removed() {
        let a = descriptor("a");
        let stale = Uuid::new_v4();
        let result = calculate(&[a.clone()], &[stale, a.id()]);
        assert_eq!(
            result,
            Reconciliation::Normal {
                to_add: vec![],
                to_remove: vec![stale],
            }
        );
    }

    #[test]
    fn test_add_order_follows_desired_order() {
        let a = descriptor("a");
        let b = descriptor("b");
        let c = descriptor("c");
        let result = calculate(&[c.clone(), a.clone(), b.clone()], &[]);
        match result {
            Reconciliation::Normal { to_add, .. } => {
                let names: Vec<&str> = to_add.iter().map(|p| p.name()).collect();
                assert_eq!(names, ["c", "a", "b"]);
            }
            other => panic!("expected Normal, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_order_follows_applied_order() {
        let a = descriptor("a");
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let result = calculate(&[a.clone()], &[y, a.id(), x]);
        match result {
            Reconciliation::Normal { to_remove, .. } => assert_eq!(to_remove, vec![y, x]),
            other => panic!("expected Normal, got {other:?}"),
        }
    }

    proptest! {
        /// A `Normal` result never shares an id across its two sides, and
        /// `to_add ∪ (applied \ to_remove)` equals the desired set.
        #[test]
        fn prop_normal_result_is_consistent(
            desired_count in 1usize..8,
            shared in proptest::collection::vec(0u8..8, 0..8),
            extra_applied in proptest::collection::vec(any::<u128>(), 0..4),
        ) {
            let desired: Vec<Arc<PackDescriptor>> = (0..desired_count)
                .map(|i| descriptor(&format!("p{i}")))
                .collect();
            let mut applied: Vec<Uuid> = shared
                .iter()
                .filter(|&&i| (i as usize) < desired.len())
                .map(|&i| desired[i as usize].id())
                .collect();
            applied.extend(extra_applied.iter().map(|&n| Uuid::from_u128(n)));

            match calculate(&desired, &applied) {
                Reconciliation::ClearAll => prop_assert!(desired.is_empty()),
                Reconciliation::NoOp => {
                    let d: HashSet<Uuid> = desired.iter().map(|p| p.id()).collect();
                    let a: HashSet<Uuid> = applied.iter().copied().collect();
                    prop_assert_eq!(d, a);
                }
                Reconciliation::Normal { to_add, to_remove } => {
                    prop_assert!(!(to_add.is_empty() && to_remove.is_empty()));

                    let add_ids: HashSet<Uuid> = to_add.iter().map(|p| p.id()).collect();
                    let remove_ids: HashSet<Uuid> = to_remove.iter().copied().collect();
                    prop_assert!(add_ids.is_disjoint(&remove_ids));

                    let mut outcome: HashSet<Uuid> = applied
                        .iter()
                        .copied()
                        .filter(|id| !remove_ids.contains(id))
                        .collect();
                    outcome.extend(add_ids);
                    let desired_ids: HashSet<Uuid> = desired.iter().map(|p| p.id()).collect();
                    prop_assert_eq!(outcome, desired_ids);
                }
            }
        }
    }
}
