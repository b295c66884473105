//! Property tests for dependency analysis.
//!
//! Random dependency sets over a handful of component types are partitioned
//! into automatic groups; every grouping must be a legal parallel schedule
//! that keeps conflicting work in its original order.

use proptest::prelude::*;
use tessera_engine::analyze::{partition, validate};
use tessera_engine::dependency::conflict;
use tessera_engine::prelude::*;

#[derive(Debug, Clone)]
struct A;
impl Component for A {}

#[derive(Debug, Clone)]
struct B;
impl Component for B {}

#[derive(Debug, Clone)]
struct C;
impl Component for C {}

#[derive(Debug, Clone)]
struct D;
impl Component for D {}

fn component(index: u8) -> Metadata {
    match index % 4 {
        0 => Metadata::component::<A>(),
        1 => Metadata::component::<B>(),
        2 => Metadata::component::<C>(),
        _ => Metadata::component::<D>(),
    }
}

fn dependency_strategy() -> impl Strategy<Value = Dependency> {
    prop_oneof![
        8 => (0u8..4).prop_map(|i| Dependency::Read(component(i))),
        6 => (0u8..4).prop_map(|i| Dependency::Write(component(i))),
        1 => Just(Dependency::Unknown),
    ]
}

fn sets_strategy() -> impl Strategy<Value = Vec<Vec<Dependency>>> {
    prop::collection::vec(prop::collection::vec(dependency_strategy(), 0..4), 0..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Every item lands in exactly one group.
    #[test]
    fn partition_covers_every_item(sets in sets_strategy()) {
        let groups = partition(&sets);
        let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
        seen.sort();
        prop_assert_eq!(seen, (0..sets.len()).collect::<Vec<_>>());
        prop_assert!(groups.iter().all(|group| !group.is_empty()));
    }

    /// Groups are legal parallel schedules.
    #[test]
    fn groups_pass_the_parallel_check(sets in sets_strategy()) {
        let parent = Node::automatic([]);
        for group in partition(&sets) {
            let nodes: Vec<Node> = group.iter().map(|_| Node::sequence([])).collect();
            let members: Vec<Vec<Dependency>> = group.iter().map(|&i| sets[i].clone()).collect();
            prop_assert!(validate(&parent, &nodes, &members).is_ok());
        }
    }

    /// Conflicting items never swap order or share a group.
    #[test]
    fn conflicting_items_keep_their_order(sets in sets_strategy()) {
        let groups = partition(&sets);
        let mut group_of = vec![0; sets.len()];
        for (g, group) in groups.iter().enumerate() {
            for &item in group {
                group_of[item] = g;
            }
        }
        for i in 0..sets.len() {
            for j in i + 1..sets.len() {
                if conflict(&sets[i], &sets[j]).is_some() {
                    prop_assert!(group_of[i] < group_of[j], "{} and {} out of order", i, j);
                }
            }
        }
    }

    /// Conflict detection is symmetric in whether a conflict exists.
    #[test]
    fn conflicts_are_symmetric(
        left in prop::collection::vec(dependency_strategy(), 0..4),
        right in prop::collection::vec(dependency_strategy(), 0..4),
    ) {
        prop_assert_eq!(conflict(&left, &right).is_some(), conflict(&right, &left).is_some());
    }
}
