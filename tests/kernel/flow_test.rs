//! Derivation checks through the kernel facade.

use std::sync::Arc;

use proptest::prelude::*;
use seckernel::config::KernelConfig;
use seckernel::crypto::InMemoryKeyring;
use seckernel::flow::derivation_permitted;
use seckernel::{Lattice, SecurityKernel, SecurityLabel};
use serde_json::json;

const LEVELS: [&str; 5] = ["public", "internal", "confidential", "secret", "top_secret"];

fn kernel() -> SecurityKernel {
    SecurityKernel::new(
        KernelConfig::default(),
        Arc::new(InMemoryKeyring::new([21u8; 32])),
        None,
    )
    .expect("kernel")
}

#[test]
fn deriving_downward_is_a_flow_violation() {
    let kernel = kernel();
    let sources = [SecurityLabel::level("secret")];
    let violation = kernel
        .derived(&sources, &SecurityLabel::level("confidential"), json!({"op": "report"}))
        .expect_err("write-down");
    assert_eq!(violation.derived, SecurityLabel::level("confidential"));
    assert!(kernel
        .derived(&sources, &SecurityLabel::level("secret"), json!({"op": "report"}))
        .is_ok());
}

#[test]
fn lineage_is_attributed_to_the_current_subject() {
    let kernel = kernel();
    kernel.login("analyst", SecurityLabel::level("secret"));
    let record = kernel
        .derived(
            &[SecurityLabel::new("internal", ["ops"])],
            &SecurityLabel::new("secret", ["ops"]),
            json!({"op": "merge"}),
        )
        .expect("permitted");
    assert_eq!(record.sources.len(), 1);
    assert_eq!(record.metadata["op"], "merge");
}

proptest! {
    #[test]
    fn violation_whenever_a_source_outranks_or_escapes(
        src_levels in prop::collection::vec(0usize..5, 1..4),
        src_comps in prop::collection::vec(prop::collection::btree_set("[a-c]", 0..3), 1..4),
        derived_level in 0usize..5,
        derived_comps in prop::collection::btree_set("[a-c]", 0..3),
    ) {
        let lattice = Lattice::default();
        let sources: Vec<SecurityLabel> = src_levels
            .iter()
            .zip(src_comps.iter().cycle())
            .map(|(level, comps)| SecurityLabel::new(LEVELS[*level], comps.iter().cloned()))
            .collect();
        let derived = SecurityLabel::new(LEVELS[derived_level], derived_comps.iter().cloned());

        let max_rank = src_levels.iter().copied().max().unwrap_or(0);
        let covered = sources
            .iter()
            .all(|s| s.compartments.is_subset(&derived.compartments));
        let expected = max_rank <= derived_level && covered;
        prop_assert_eq!(derivation_permitted(&lattice, &sources, &derived), expected);
    }
}
