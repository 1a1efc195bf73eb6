//! MAC rule properties and the concrete read/write scenarios.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use seckernel::audit::sink::{ChannelSink, NullSink};
use seckernel::audit::AuditEventType;
use seckernel::mac::{read_permitted, write_permitted, MacEngine, Operation};
use seckernel::policy::AuditPolicy;
use seckernel::{Lattice, SecurityLabel};

fn label_strategy() -> impl Strategy<Value = SecurityLabel> {
    (
        prop::sample::select(vec![
            "public",
            "internal",
            "confidential",
            "secret",
            "top_secret",
            "cosmic",
        ]),
        prop::collection::btree_set(prop::sample::select(vec!["a", "b", "c", "NATO"]), 0..4),
    )
        .prop_map(|(level, comps): (&str, BTreeSet<&str>)| SecurityLabel::new(level, comps))
}

fn ranks(lattice: &Lattice, s: &SecurityLabel, o: &SecurityLabel) -> Option<(usize, usize)> {
    Some((lattice.rank(&s.classification)?, lattice.rank(&o.classification)?))
}

proptest! {
    #[test]
    fn read_rule_is_dominance(s in label_strategy(), o in label_strategy()) {
        let lattice = Lattice::default();
        let expected = ranks(&lattice, &s, &o)
            .is_some_and(|(rs, ro)| rs >= ro && s.compartments.is_superset(&o.compartments));
        prop_assert_eq!(read_permitted(&lattice, &s, &o), expected);
    }

    #[test]
    fn write_rule_is_inverse_dominance(s in label_strategy(), o in label_strategy()) {
        let lattice = Lattice::default();
        let expected = ranks(&lattice, &s, &o)
            .is_some_and(|(rs, ro)| rs <= ro && s.compartments.is_subset(&o.compartments));
        prop_assert_eq!(write_permitted(&lattice, &s, &o), expected);
    }

    #[test]
    fn cached_decisions_match_fresh_ones(s in label_strategy(), o in label_strategy()) {
        let lattice = Arc::new(Lattice::default());
        let engine = MacEngine::new(Arc::clone(&lattice), 4, Arc::new(NullSink), AuditPolicy::default());
        let first = engine.can_read(&s, &o);
        let second = engine.can_read(&s, &o);
        prop_assert_eq!(first, second);
        prop_assert_eq!(first, read_permitted(&lattice, &s, &o));
    }
}

#[test]
fn scenario_read_down_allowed_read_up_denied() {
    let engine = MacEngine::new(Arc::new(Lattice::default()), 16, Arc::new(NullSink), AuditPolicy::default());
    let subject = SecurityLabel::new("secret", ["NATO"]);
    assert!(engine.can_read(&subject, &SecurityLabel::level("confidential")));
    assert!(!engine.can_read(&subject, &SecurityLabel::level("top_secret")));
}

#[test]
fn scenario_write_up_allowed_write_down_denied() {
    let engine = MacEngine::new(Arc::new(Lattice::default()), 16, Arc::new(NullSink), AuditPolicy::default());
    let subject = SecurityLabel::level("confidential");
    assert!(engine.can_write(&subject, &SecurityLabel::new("secret", ["NATO"])));
    assert!(!engine.can_write(&subject, &SecurityLabel::level("public")));
}

#[test]
fn denial_is_returned_and_audited() {
    let (sink, mut rx) = ChannelSink::channel(16);
    let engine = MacEngine::new(Arc::new(Lattice::default()), 16, Arc::new(sink), AuditPolicy::default());
    let err = engine
        .enforce_no_read_up(&SecurityLabel::level("internal"), &SecurityLabel::level("secret"))
        .expect_err("read up denied");
    assert_eq!(err.operation, Operation::Read);

    let mut types = Vec::new();
    while let Ok(event) = rx.try_recv() {
        types.push(event.event_type);
    }
    assert!(types.contains(&AuditEventType::MacDecision));
    assert!(types.contains(&AuditEventType::MacViolation));
}

#[test]
fn full_audit_channel_never_changes_a_decision() {
    let (sink, _rx) = ChannelSink::channel(1);
    let sink = Arc::new(sink);
    let engine = MacEngine::new(
        Arc::new(Lattice::default()),
        16,
        Arc::clone(&sink) as Arc<dyn seckernel::audit::AuditSink>,
        AuditPolicy::default(),
    );
    for _ in 0..10 {
        assert!(engine.can_read(&SecurityLabel::level("secret"), &SecurityLabel::level("public")));
        assert!(engine
            .enforce_no_write_down(&SecurityLabel::level("secret"), &SecurityLabel::level("public"))
            .is_err());
    }
    assert!(sink.dropped() > 0);
}
