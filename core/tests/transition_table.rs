//! Property tests over the whole transition table.
//!
//! For every `(source, target, roles)` combination not present in the
//! table, `attempt_transition` must reject the attempt and leave the
//! convention untouched; whenever it succeeds it must land on the target
//! and emit at least one event.

use chrono::Utc;
use conventions_core::convention::{
    Convention, ConventionId, ConventionStatus, Role, Signatories, Signatory, SignatoryRole,
};
use conventions_core::transition::{
    TransitionContext, TransitionError, attempt_transition, config_for,
};
use proptest::prelude::*;
use proptest::sample::select;
use uuid::Uuid;

fn fixture(status: ConventionStatus) -> Convention {
    Convention {
        id: ConventionId::generate(),
        status,
        agency_id: Uuid::nil(),
        establishment_name: "Garage Dupont".into(),
        immersion_objective: "Discover vehicle repair".into(),
        start_date: Utc::now(),
        end_date: Utc::now(),
        signatories: Signatories {
            beneficiary: Signatory::new("Ada".into(), "ada@example.com".into()),
            beneficiary_representative: None,
            establishment_representative: Signatory::new(
                "Linus".into(),
                "linus@example.com".into(),
            ),
        },
        status_justification: None,
    }
}

proptest! {
    #[test]
    fn attempts_outside_the_table_are_rejected_without_mutation(
        source in select(ConventionStatus::ALL.to_vec()),
        target in select(ConventionStatus::ALL.to_vec()),
        roles in proptest::collection::vec(select(Role::ALL.to_vec()), 0..4),
    ) {
        let convention = fixture(source);
        let ctx = TransitionContext {
            now: Utc::now(),
            signatory: Some(SignatoryRole::Beneficiary),
            justification: Some("property-test justification".into()),
        };
        let config = config_for(target);

        let result = attempt_transition(&convention, target, &roles, &ctx);

        if !config.allows_source(source) {
            prop_assert!(
                matches!(result, Err(TransitionError::IllegalSourceState { .. })),
                "expected IllegalSourceState, got {:?}",
                result
            );
        } else if !config.allows_any_role(&roles) {
            prop_assert!(
                matches!(result, Err(TransitionError::ForbiddenRole { .. })),
                "expected ForbiddenRole, got {:?}",
                result
            );
        } else if let Ok(outcome) = result {
            prop_assert!(!outcome.events.is_empty());
            prop_assert_eq!(outcome.convention.status, target);
            for event in &outcome.events {
                prop_assert_eq!(event.convention().status, target);
            }
        }
        // The input value is never mutated, whatever the verdict.
        prop_assert_eq!(convention.status, source);
    }

    #[test]
    fn terminal_sources_never_transition(
        target in select(ConventionStatus::ALL.to_vec()),
        roles in proptest::collection::vec(select(Role::ALL.to_vec()), 1..4),
    ) {
        for source in ConventionStatus::ALL.into_iter().filter(ConventionStatus::is_terminal) {
            let convention = fixture(source);
            let result = attempt_transition(
                &convention,
                target,
                &roles,
                &TransitionContext::at(Utc::now()),
            );
            prop_assert!(
                matches!(result, Err(TransitionError::IllegalSourceState { .. })),
                "expected IllegalSourceState, got {:?}",
                result
            );
        }
    }
}
