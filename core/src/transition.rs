//! The convention status state machine.
//!
//! For each target status there is a fixed [`TransitionConfig`]: the set of
//! source statuses it may be reached from, the set of roles allowed to
//! trigger it, and an optional business-rule guard. [`attempt_transition`]
//! checks those three things in order and, on success, returns the new
//! convention value together with the events to append; the caller
//! persists both in one atomic unit via
//! [`crate::outbox::TransitionStore::persist_transition`].
//!
//! Transitions are pure with respect to delivery: they never invoke
//! subscribers, and a rejected transition produces no event at all. A
//! transition to the state the convention is already in is only legal when
//! that state appears in `valid_initial_statuses` (signing while
//! `PARTIALLY_SIGNED` is the one case); everything else is rejected rather
//! than treated as a no-op, so a retried request cannot emit a duplicate
//! event.

use crate::convention::{Convention, ConventionStatus, Role, SignatoryRole};
use crate::event::ConventionEvent;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Why a transition attempt was rejected.
///
/// All three variants are synchronous and surfaced to the caller before any
/// mutation; none of them is ever retried by the delivery machinery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The convention's current status is not a legal source for the target.
    #[error("cannot move a {from} convention to {target}")]
    IllegalSourceState {
        /// The convention's current status.
        from: ConventionStatus,
        /// The requested target status.
        target: ConventionStatus,
    },

    /// None of the acting roles may trigger this transition.
    #[error("none of the roles {roles:?} may move a convention to {target}")]
    ForbiddenRole {
        /// The requested target status.
        target: ConventionStatus,
        /// The roles the caller acted with.
        roles: Vec<Role>,
    },

    /// A business-rule guard rejected the transition.
    #[error("transition guard failed: {reason}")]
    GuardFailed {
        /// Human-readable reason, surfaced to the caller.
        reason: String,
    },
}

/// Caller-supplied context for a transition attempt.
#[derive(Clone, Debug)]
pub struct TransitionContext {
    /// Timestamp to record on signatures and events.
    pub now: DateTime<Utc>,
    /// Which party is signing, for signature transitions.
    pub signatory: Option<SignatoryRole>,
    /// Justification, required by `REJECTED` and `DEPRECATED`.
    pub justification: Option<String>,
}

impl TransitionContext {
    /// Context with only a timestamp.
    #[must_use]
    pub const fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            signatory: None,
            justification: None,
        }
    }

    /// Context for a signature by `role`.
    #[must_use]
    pub const fn signature(now: DateTime<Utc>, role: SignatoryRole) -> Self {
        Self {
            now,
            signatory: Some(role),
            justification: None,
        }
    }

    /// Context carrying a justification.
    #[must_use]
    pub const fn justified(now: DateTime<Utc>, justification: String) -> Self {
        Self {
            now,
            signatory: None,
            justification: Some(justification),
        }
    }
}

/// The static configuration for reaching one target status.
#[derive(Debug, Clone, Copy)]
pub struct TransitionConfig {
    /// Statuses the convention may currently be in.
    pub valid_initial_statuses: &'static [ConventionStatus],
    /// Roles allowed to trigger the transition.
    pub valid_roles: &'static [Role],
}

impl TransitionConfig {
    /// Whether `status` is a legal source for this transition.
    #[must_use]
    pub fn allows_source(&self, status: ConventionStatus) -> bool {
        self.valid_initial_statuses.contains(&status)
    }

    /// Whether any of `roles` may trigger this transition.
    #[must_use]
    pub fn allows_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|role| self.valid_roles.contains(role))
    }
}

const SIGNATORY_ROLES: &[Role] = &[
    Role::Beneficiary,
    Role::BeneficiaryRepresentative,
    Role::EstablishmentRepresentative,
];

const READY_TO_SIGN: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[ConventionStatus::Draft],
    valid_roles: &[
        Role::Beneficiary,
        Role::EstablishmentRepresentative,
        Role::BackOffice,
    ],
};

const PARTIALLY_SIGNED: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::ReadyToSign,
        ConventionStatus::PartiallySigned,
    ],
    valid_roles: SIGNATORY_ROLES,
};

const IN_REVIEW: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::ReadyToSign,
        ConventionStatus::PartiallySigned,
    ],
    valid_roles: SIGNATORY_ROLES,
};

const ACCEPTED_BY_COUNSELLOR: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[ConventionStatus::InReview],
    valid_roles: &[Role::Counsellor],
};

const ACCEPTED_BY_VALIDATOR: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::InReview,
        ConventionStatus::AcceptedByCounsellor,
    ],
    valid_roles: &[Role::Validator],
};

const REJECTED: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::InReview,
        ConventionStatus::AcceptedByCounsellor,
    ],
    valid_roles: &[Role::Counsellor, Role::Validator],
};

const CANCELLED: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::Draft,
        ConventionStatus::ReadyToSign,
        ConventionStatus::PartiallySigned,
    ],
    valid_roles: &[
        Role::Beneficiary,
        Role::EstablishmentRepresentative,
        Role::BackOffice,
    ],
};

const DEPRECATED: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[
        ConventionStatus::Draft,
        ConventionStatus::ReadyToSign,
        ConventionStatus::PartiallySigned,
        ConventionStatus::InReview,
        ConventionStatus::AcceptedByCounsellor,
    ],
    valid_roles: &[Role::BackOffice],
};

// DRAFT is initial only: no transition leads back to it.
const DRAFT: TransitionConfig = TransitionConfig {
    valid_initial_statuses: &[],
    valid_roles: &[],
};

/// The transition configuration for a target status.
#[must_use]
pub const fn config_for(target: ConventionStatus) -> &'static TransitionConfig {
    match target {
        ConventionStatus::Draft => &DRAFT,
        ConventionStatus::ReadyToSign => &READY_TO_SIGN,
        ConventionStatus::PartiallySigned => &PARTIALLY_SIGNED,
        ConventionStatus::InReview => &IN_REVIEW,
        ConventionStatus::AcceptedByCounsellor => &ACCEPTED_BY_COUNSELLOR,
        ConventionStatus::AcceptedByValidator => &ACCEPTED_BY_VALIDATOR,
        ConventionStatus::Rejected => &REJECTED,
        ConventionStatus::Cancelled => &CANCELLED,
        ConventionStatus::Deprecated => &DEPRECATED,
    }
}

/// A successful transition: the new convention value and the events to
/// persist with it.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionOutcome {
    /// The convention after the transition.
    pub convention: Convention,
    /// The events to append in the same atomic unit. Never empty.
    pub events: Vec<ConventionEvent>,
}

/// Attempt to move `convention` to `target`.
///
/// Checks, in order: the source status against the target's
/// `valid_initial_statuses`, the acting roles against its `valid_roles`,
/// then the target-specific guard. On success returns the new convention
/// and at least one event; the final signature is a compound transition
/// emitting both the signatory-specific topic and `ConventionFullySigned`.
///
/// # Errors
///
/// - [`TransitionError::IllegalSourceState`] when the current status is not
///   a legal source for `target`
/// - [`TransitionError::ForbiddenRole`] when no acting role is allowed
/// - [`TransitionError::GuardFailed`] when a business rule rejects the
///   attempt (missing justification, signing twice, wrong signature count)
pub fn attempt_transition(
    convention: &Convention,
    target: ConventionStatus,
    acting_roles: &[Role],
    ctx: &TransitionContext,
) -> Result<TransitionOutcome, TransitionError> {
    let config = config_for(target);

    if !config.allows_source(convention.status) {
        return Err(TransitionError::IllegalSourceState {
            from: convention.status,
            target,
        });
    }
    if !config.allows_any_role(acting_roles) {
        return Err(TransitionError::ForbiddenRole {
            target,
            roles: acting_roles.to_vec(),
        });
    }

    match target {
        ConventionStatus::ReadyToSign => {
            let mut next = convention.clone();
            next.status = target;
            let events = vec![ConventionEvent::ConventionReadyToSign {
                convention: next.clone(),
            }];
            Ok(TransitionOutcome {
                convention: next,
                events,
            })
        }
        ConventionStatus::PartiallySigned => {
            let (next, role) = apply_signature(convention, acting_roles, ctx)?;
            if next.signatories.all_signed() {
                return Err(TransitionError::GuardFailed {
                    reason: "this is the final signature; the convention must move to IN_REVIEW"
                        .into(),
                });
            }
            next_with_status(next, target, |snapshot| {
                vec![signed_event(role, snapshot, ctx.now)]
            })
        }
        ConventionStatus::InReview => {
            let (next, role) = apply_signature(convention, acting_roles, ctx)?;
            if !next.signatories.all_signed() {
                return Err(TransitionError::GuardFailed {
                    reason: "not all signatories have signed yet".into(),
                });
            }
            next_with_status(next, target, |snapshot| {
                vec![
                    signed_event(role, snapshot.clone(), ctx.now),
                    ConventionEvent::ConventionFullySigned {
                        convention: snapshot,
                    },
                ]
            })
        }
        ConventionStatus::AcceptedByCounsellor => {
            next_with_status(convention.clone(), target, |snapshot| {
                vec![ConventionEvent::ConventionAcceptedByCounsellor {
                    convention: snapshot,
                }]
            })
        }
        ConventionStatus::AcceptedByValidator => {
            next_with_status(convention.clone(), target, |snapshot| {
                vec![ConventionEvent::ConventionAcceptedByValidator {
                    convention: snapshot,
                }]
            })
        }
        ConventionStatus::Rejected => {
            let justification = require_justification(ctx, "a rejection")?;
            let mut next = convention.clone();
            next.status_justification = Some(justification.clone());
            next_with_status(next, target, |snapshot| {
                vec![ConventionEvent::ConventionRejected {
                    convention: snapshot,
                    justification,
                }]
            })
        }
        ConventionStatus::Cancelled => {
            next_with_status(convention.clone(), target, |snapshot| {
                vec![ConventionEvent::ConventionCancelled {
                    convention: snapshot,
                }]
            })
        }
        ConventionStatus::Deprecated => {
            let justification = require_justification(ctx, "a deprecation")?;
            let mut next = convention.clone();
            next.status_justification = Some(justification.clone());
            next_with_status(next, target, |snapshot| {
                vec![ConventionEvent::ConventionDeprecated {
                    convention: snapshot,
                    justification,
                }]
            })
        }
        // Unreachable in practice: DRAFT has no valid sources, so the
        // source check above already rejected the attempt.
        ConventionStatus::Draft => Err(TransitionError::IllegalSourceState {
            from: convention.status,
            target,
        }),
    }
}

/// Record a signature by whichever signatory role the caller acts with.
///
/// Convenience wrapper around [`attempt_transition`] for callers that do
/// not want to compute the target themselves: picks `IN_REVIEW` when this
/// signature is the last one required, `PARTIALLY_SIGNED` otherwise.
///
/// # Errors
///
/// Same as [`attempt_transition`].
pub fn sign(
    convention: &Convention,
    role: SignatoryRole,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, TransitionError> {
    let ctx = TransitionContext::signature(now, role);
    let mut after = convention.signatories.clone();
    let target = if after.sign(role, now) && after.all_signed() {
        ConventionStatus::InReview
    } else {
        ConventionStatus::PartiallySigned
    };
    attempt_transition(convention, target, &[role.as_role()], &ctx)
}

fn apply_signature(
    convention: &Convention,
    acting_roles: &[Role],
    ctx: &TransitionContext,
) -> Result<(Convention, SignatoryRole), TransitionError> {
    let role = ctx.signatory.ok_or_else(|| TransitionError::GuardFailed {
        reason: "a signature transition requires a signatory role in the context".into(),
    })?;
    if !acting_roles.contains(&role.as_role()) {
        return Err(TransitionError::GuardFailed {
            reason: format!("the caller does not act as the signing party {role}"),
        });
    }
    match convention.signatories.get(role) {
        None => Err(TransitionError::GuardFailed {
            reason: format!("this convention has no {role} signatory"),
        }),
        Some(signatory) if signatory.has_signed() => Err(TransitionError::GuardFailed {
            reason: format!("the {role} has already signed"),
        }),
        Some(_) => {
            let mut next = convention.clone();
            next.signatories.sign(role, ctx.now);
            Ok((next, role))
        }
    }
}

fn next_with_status<F>(
    mut next: Convention,
    target: ConventionStatus,
    events: F,
) -> Result<TransitionOutcome, TransitionError>
where
    F: FnOnce(Convention) -> Vec<ConventionEvent>,
{
    next.status = target;
    let events = events(next.clone());
    Ok(TransitionOutcome {
        convention: next,
        events,
    })
}

fn require_justification(
    ctx: &TransitionContext,
    what: &str,
) -> Result<String, TransitionError> {
    match ctx.justification.as_deref().map(str::trim) {
        Some(justification) if !justification.is_empty() => Ok(justification.to_owned()),
        _ => Err(TransitionError::GuardFailed {
            reason: format!("{what} requires a justification"),
        }),
    }
}

fn signed_event(
    role: SignatoryRole,
    convention: Convention,
    signed_at: DateTime<Utc>,
) -> ConventionEvent {
    match role {
        SignatoryRole::Beneficiary => ConventionEvent::BeneficiarySigned {
            convention,
            signed_at,
        },
        SignatoryRole::BeneficiaryRepresentative => {
            ConventionEvent::BeneficiaryRepresentativeSigned {
                convention,
                signed_at,
            }
        }
        SignatoryRole::EstablishmentRepresentative => {
            ConventionEvent::EstablishmentRepresentativeSigned {
                convention,
                signed_at,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::convention::{ConventionId, Signatories, Signatory};
    use crate::event::Topic;
    use uuid::Uuid;

    fn ready_convention() -> Convention {
        Convention {
            id: ConventionId::generate(),
            status: ConventionStatus::ReadyToSign,
            agency_id: Uuid::new_v4(),
            establishment_name: "Boulangerie Martin".into(),
            immersion_objective: "Discover the baker trade".into(),
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

    fn in_review_convention() -> Convention {
        let mut convention = ready_convention();
        let now = Utc::now();
        convention.signatories.sign(SignatoryRole::Beneficiary, now);
        convention
            .signatories
            .sign(SignatoryRole::EstablishmentRepresentative, now);
        convention.status = ConventionStatus::InReview;
        convention
    }

    #[test]
    fn beneficiary_partial_signature_emits_beneficiary_signed() {
        // Scenario: READY_TO_SIGN, beneficiary signs, establishment has not.
        let convention = ready_convention();
        let ctx = TransitionContext::signature(Utc::now(), SignatoryRole::Beneficiary);

        let outcome = attempt_transition(
            &convention,
            ConventionStatus::PartiallySigned,
            &[Role::Beneficiary],
            &ctx,
        )
        .unwrap();

        assert_eq!(outcome.convention.status, ConventionStatus::PartiallySigned);
        assert!(outcome.convention.signatories.beneficiary.has_signed());
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].topic(), Topic::BeneficiarySigned);
        // The emitted snapshot is the post-transition value.
        assert_eq!(
            outcome.events[0].convention().status,
            ConventionStatus::PartiallySigned
        );
    }

    #[test]
    fn forbidden_role_is_rejected_without_effects() {
        // Scenario: a counsellor cannot sign.
        let convention = ready_convention();
        let ctx = TransitionContext::signature(Utc::now(), SignatoryRole::Beneficiary);

        let err = attempt_transition(
            &convention,
            ConventionStatus::PartiallySigned,
            &[Role::Counsellor],
            &ctx,
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::ForbiddenRole { .. }));
        assert_eq!(convention.status, ConventionStatus::ReadyToSign);
    }

    #[test]
    fn illegal_source_state_is_rejected() {
        let mut convention = ready_convention();
        convention.status = ConventionStatus::Rejected;

        let err = attempt_transition(
            &convention,
            ConventionStatus::PartiallySigned,
            &[Role::Beneficiary],
            &TransitionContext::signature(Utc::now(), SignatoryRole::Beneficiary),
        )
        .unwrap_err();

        assert_eq!(
            err,
            TransitionError::IllegalSourceState {
                from: ConventionStatus::Rejected,
                target: ConventionStatus::PartiallySigned,
            }
        );
    }

    #[test]
    fn final_signature_is_a_compound_transition() {
        let mut convention = ready_convention();
        convention.signatories.sign(SignatoryRole::Beneficiary, Utc::now());
        convention.status = ConventionStatus::PartiallySigned;

        let ctx = TransitionContext::signature(
            Utc::now(),
            SignatoryRole::EstablishmentRepresentative,
        );
        let outcome = attempt_transition(
            &convention,
            ConventionStatus::InReview,
            &[Role::EstablishmentRepresentative],
            &ctx,
        )
        .unwrap();

        assert_eq!(outcome.convention.status, ConventionStatus::InReview);
        let topics: Vec<Topic> = outcome.events.iter().map(ConventionEvent::topic).collect();
        assert_eq!(
            topics,
            vec![
                Topic::EstablishmentRepresentativeSigned,
                Topic::ConventionFullySigned
            ]
        );
    }

    #[test]
    fn premature_review_is_guarded() {
        // Only one of two signatures present: IN_REVIEW must be refused.
        let convention = ready_convention();
        let ctx = TransitionContext::signature(Utc::now(), SignatoryRole::Beneficiary);

        let err = attempt_transition(
            &convention,
            ConventionStatus::InReview,
            &[Role::Beneficiary],
            &ctx,
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::GuardFailed { .. }));
    }

    #[test]
    fn final_signature_cannot_stay_partially_signed() {
        let mut convention = ready_convention();
        convention.signatories.sign(SignatoryRole::Beneficiary, Utc::now());
        convention.status = ConventionStatus::PartiallySigned;

        let ctx = TransitionContext::signature(
            Utc::now(),
            SignatoryRole::EstablishmentRepresentative,
        );
        let err = attempt_transition(
            &convention,
            ConventionStatus::PartiallySigned,
            &[Role::EstablishmentRepresentative],
            &ctx,
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::GuardFailed { .. }));
    }

    #[test]
    fn signing_twice_is_guarded() {
        let mut convention = ready_convention();
        convention.signatories.sign(SignatoryRole::Beneficiary, Utc::now());
        convention.status = ConventionStatus::PartiallySigned;

        let ctx = TransitionContext::signature(Utc::now(), SignatoryRole::Beneficiary);
        let err = attempt_transition(
            &convention,
            ConventionStatus::PartiallySigned,
            &[Role::Beneficiary],
            &ctx,
        )
        .unwrap_err();

        assert!(matches!(err, TransitionError::GuardFailed { .. }));
    }

    #[test]
    fn rejection_requires_a_justification() {
        let convention = in_review_convention();

        let err = attempt_transition(
            &convention,
            ConventionStatus::Rejected,
            &[Role::Validator],
            &TransitionContext::at(Utc::now()),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::GuardFailed { .. }));

        let outcome = attempt_transition(
            &convention,
            ConventionStatus::Rejected,
            &[Role::Validator],
            &TransitionContext::justified(Utc::now(), "dates overlap another convention".into()),
        )
        .unwrap();
        assert_eq!(outcome.convention.status, ConventionStatus::Rejected);
        assert_eq!(
            outcome.convention.status_justification.as_deref(),
            Some("dates overlap another convention")
        );
        assert_eq!(outcome.events[0].topic(), Topic::ConventionRejected);
    }

    #[test]
    fn validator_may_accept_directly_from_review() {
        let convention = in_review_convention();

        let outcome = attempt_transition(
            &convention,
            ConventionStatus::AcceptedByValidator,
            &[Role::Validator],
            &TransitionContext::at(Utc::now()),
        )
        .unwrap();

        assert_eq!(
            outcome.convention.status,
            ConventionStatus::AcceptedByValidator
        );
        assert_eq!(
            outcome.events[0].topic(),
            Topic::ConventionAcceptedByValidator
        );
    }

    #[test]
    fn nothing_transitions_back_to_draft() {
        for status in ConventionStatus::ALL {
            let mut convention = ready_convention();
            convention.status = status;
            let err = attempt_transition(
                &convention,
                ConventionStatus::Draft,
                &[Role::BackOffice],
                &TransitionContext::at(Utc::now()),
            )
            .unwrap_err();
            assert!(matches!(err, TransitionError::IllegalSourceState { .. }));
        }
    }

    #[test]
    fn sign_picks_the_right_target() {
        let convention = ready_convention();
        let first = sign(&convention, SignatoryRole::Beneficiary, Utc::now()).unwrap();
        assert_eq!(first.convention.status, ConventionStatus::PartiallySigned);

        let second = sign(
            &first.convention,
            SignatoryRole::EstablishmentRepresentative,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(second.convention.status, ConventionStatus::InReview);
        assert_eq!(second.events.len(), 2);
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for source in ConventionStatus::ALL.into_iter().filter(ConventionStatus::is_terminal) {
            for target in ConventionStatus::ALL {
                assert!(
                    !config_for(target).allows_source(source),
                    "{source} -> {target} should not be configured"
                );
            }
        }
    }
}
