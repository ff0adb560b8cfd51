//! Tests for allocation preferences and fulfiller constraints

use prometheus_core_pool::core::{CoreAllocationPreference, CoreFulfillerConstraint};

const ALL_PREFERENCES: [CoreAllocationPreference; 3] = [
    CoreAllocationPreference::RequireLocal,
    CoreAllocationPreference::PreferLocal,
    CoreAllocationPreference::PreferRemote,
];

fn admitted(constraint: CoreFulfillerConstraint) -> Vec<CoreAllocationPreference> {
    ALL_PREFERENCES
        .into_iter()
        .filter(|preference| constraint.admits(*preference))
        .collect()
}

#[test]
fn test_only_require_local_is_local() {
    assert!(CoreAllocationPreference::RequireLocal.is_local());
    assert!(!CoreAllocationPreference::PreferLocal.is_local());
    assert!(!CoreAllocationPreference::PreferRemote.is_local());
}

#[test]
fn test_constraint_admission() {
    use CoreAllocationPreference::{PreferLocal, PreferRemote, RequireLocal};

    assert_eq!(admitted(CoreFulfillerConstraint::All), ALL_PREFERENCES.to_vec());
    assert_eq!(admitted(CoreFulfillerConstraint::LocalRequiredOnly), vec![RequireLocal]);
    assert_eq!(
        admitted(CoreFulfillerConstraint::LocalRequiredAndPreferred),
        vec![RequireLocal, PreferLocal]
    );
    assert_eq!(
        admitted(CoreFulfillerConstraint::LocalPreferredAndRemote),
        vec![PreferLocal, PreferRemote]
    );
}

#[test]
fn test_preference_serde_names() {
    let json = serde_json::to_string(&CoreAllocationPreference::PreferRemote).unwrap();
    assert_eq!(json, "\"prefer_remote\"");

    let parsed: CoreFulfillerConstraint =
        serde_json::from_str("\"local_required_and_preferred\"").unwrap();
    assert_eq!(parsed, CoreFulfillerConstraint::LocalRequiredAndPreferred);
}
