//! Convention aggregate: the multi-party agreement whose lifecycle this
//! workspace governs.
//!
//! A convention is signed by up to three parties (the beneficiary, an
//! optional beneficiary representative, and the host establishment's
//! representative) and then reviewed by agency-side validators. Its `status`
//! field only ever moves along the edges the transition table in
//! [`crate::transition`] allows; nothing else in the workspace mutates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a convention.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConventionId(Uuid);

impl ConventionId {
    /// Creates an identifier from an existing UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConventionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Legal lifecycle states of a convention.
///
/// `Draft` is the initial state. `AcceptedByValidator`, `Rejected`,
/// `Cancelled` and `Deprecated` are terminal: no transition in the table
/// accepts them as a source.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConventionStatus {
    /// Being drafted, not yet open for signatures.
    Draft,
    /// Complete and awaiting its first signature.
    ReadyToSign,
    /// At least one signatory has signed, at least one has not.
    PartiallySigned,
    /// Fully signed, awaiting agency review.
    InReview,
    /// Accepted by an agency counsellor, awaiting final validation.
    AcceptedByCounsellor,
    /// Fully validated. Terminal.
    AcceptedByValidator,
    /// Rejected by the agency with a justification. Terminal.
    Rejected,
    /// Cancelled by one of the parties before review completed. Terminal.
    Cancelled,
    /// Administratively retired (superseded or expired). Terminal.
    Deprecated,
}

impl ConventionStatus {
    /// Every legal status, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Draft,
        Self::ReadyToSign,
        Self::PartiallySigned,
        Self::InReview,
        Self::AcceptedByCounsellor,
        Self::AcceptedByValidator,
        Self::Rejected,
        Self::Cancelled,
        Self::Deprecated,
    ];

    /// Stable wire name used in storage and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::ReadyToSign => "READY_TO_SIGN",
            Self::PartiallySigned => "PARTIALLY_SIGNED",
            Self::InReview => "IN_REVIEW",
            Self::AcceptedByCounsellor => "ACCEPTED_BY_COUNSELLOR",
            Self::AcceptedByValidator => "ACCEPTED_BY_VALIDATOR",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Deprecated => "DEPRECATED",
        }
    }

    /// Parse a status from its wire name.
    ///
    /// # Errors
    ///
    /// Returns the unrecognised input when it matches no known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown convention status: {s}"))
    }

    /// Whether this status ends the normal lifecycle.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AcceptedByValidator | Self::Rejected | Self::Cancelled | Self::Deprecated
        )
    }
}

impl fmt::Display for ConventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acting roles supplied by the caller of a transition.
///
/// Role resolution (who the authenticated principal is, which roles they
/// hold) happens upstream and is trusted input here.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// The person doing the immersion.
    Beneficiary,
    /// Legal representative of the beneficiary (e.g. for minors).
    BeneficiaryRepresentative,
    /// Representative of the host establishment.
    EstablishmentRepresentative,
    /// Agency-side counsellor reviewing the convention.
    Counsellor,
    /// Agency-side validator giving the final approval.
    Validator,
    /// Back-office administrator.
    BackOffice,
}

impl Role {
    /// Every role, used by property tests to enumerate inputs.
    pub const ALL: [Self; 6] = [
        Self::Beneficiary,
        Self::BeneficiaryRepresentative,
        Self::EstablishmentRepresentative,
        Self::Counsellor,
        Self::Validator,
        Self::BackOffice,
    ];
}

/// The subset of roles with signing capability.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatoryRole {
    /// The beneficiary themselves.
    Beneficiary,
    /// The beneficiary's legal representative.
    BeneficiaryRepresentative,
    /// The host establishment's representative.
    EstablishmentRepresentative,
}

impl SignatoryRole {
    /// The acting [`Role`] corresponding to this signatory.
    #[must_use]
    pub const fn as_role(&self) -> Role {
        match self {
            Self::Beneficiary => Role::Beneficiary,
            Self::BeneficiaryRepresentative => Role::BeneficiaryRepresentative,
            Self::EstablishmentRepresentative => Role::EstablishmentRepresentative,
        }
    }
}

impl fmt::Display for SignatoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beneficiary => f.write_str("beneficiary"),
            Self::BeneficiaryRepresentative => f.write_str("beneficiary-representative"),
            Self::EstablishmentRepresentative => f.write_str("establishment-representative"),
        }
    }
}

/// One party expected to sign the convention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatory {
    /// Display name of the party.
    pub name: String,
    /// Contact address used by the notification subscribers.
    pub email: String,
    /// When the party signed, if they have.
    pub signed_at: Option<DateTime<Utc>>,
}

impl Signatory {
    /// Creates a signatory that has not signed yet.
    #[must_use]
    pub const fn new(name: String, email: String) -> Self {
        Self {
            name,
            email,
            signed_at: None,
        }
    }

    /// Whether this party has signed.
    #[must_use]
    pub const fn has_signed(&self) -> bool {
        self.signed_at.is_some()
    }
}

/// The full set of parties whose signatures the convention requires.
///
/// The beneficiary representative is optional; when absent, only the two
/// mandatory signatures are required for the convention to count as fully
/// signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signatories {
    /// The beneficiary's signature slot.
    pub beneficiary: Signatory,
    /// The optional legal-representative signature slot.
    pub beneficiary_representative: Option<Signatory>,
    /// The establishment representative's signature slot.
    pub establishment_representative: Signatory,
}

impl Signatories {
    /// Looks up the signatory slot for a role, if the convention has one.
    #[must_use]
    pub const fn get(&self, role: SignatoryRole) -> Option<&Signatory> {
        match role {
            SignatoryRole::Beneficiary => Some(&self.beneficiary),
            SignatoryRole::BeneficiaryRepresentative => self.beneficiary_representative.as_ref(),
            SignatoryRole::EstablishmentRepresentative => {
                Some(&self.establishment_representative)
            }
        }
    }

    /// Records a signature for `role` at `signed_at`.
    ///
    /// Returns `false` when the convention has no slot for that role; the
    /// caller treats that as a guard failure.
    pub fn sign(&mut self, role: SignatoryRole, signed_at: DateTime<Utc>) -> bool {
        let slot = match role {
            SignatoryRole::Beneficiary => Some(&mut self.beneficiary),
            SignatoryRole::BeneficiaryRepresentative => self.beneficiary_representative.as_mut(),
            SignatoryRole::EstablishmentRepresentative => {
                Some(&mut self.establishment_representative)
            }
        };
        match slot {
            Some(signatory) => {
                signatory.signed_at = Some(signed_at);
                true
            }
            None => false,
        }
    }

    /// Whether every required party has signed.
    #[must_use]
    pub fn all_signed(&self) -> bool {
        self.beneficiary.has_signed()
            && self.establishment_representative.has_signed()
            && self
                .beneficiary_representative
                .as_ref()
                .is_none_or(Signatory::has_signed)
    }

    /// Whether at least one party has signed.
    #[must_use]
    pub fn any_signed(&self) -> bool {
        self.beneficiary.has_signed()
            || self.establishment_representative.has_signed()
            || self
                .beneficiary_representative
                .as_ref()
                .is_some_and(Signatory::has_signed)
    }
}

/// The convention aggregate.
///
/// Business fields carry the snapshot subscribers need; the interesting part
/// for this core is `status` and `signatories`, which only
/// [`crate::transition::attempt_transition`] mutates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convention {
    /// Unique identifier.
    pub id: ConventionId,
    /// Current lifecycle state.
    pub status: ConventionStatus,
    /// Identifier of the oversight agency handling the review.
    pub agency_id: Uuid,
    /// Name of the host establishment.
    pub establishment_name: String,
    /// What the beneficiary will be doing during the immersion.
    pub immersion_objective: String,
    /// First day of the immersion.
    pub start_date: DateTime<Utc>,
    /// Last day of the immersion.
    pub end_date: DateTime<Utc>,
    /// The parties whose signatures are required.
    pub signatories: Signatories,
    /// Justification recorded by a rejection or deprecation.
    pub status_justification: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn signatories(with_representative: bool) -> Signatories {
        Signatories {
            beneficiary: Signatory::new("Ada".into(), "ada@example.com".into()),
            beneficiary_representative: with_representative
                .then(|| Signatory::new("Grace".into(), "grace@example.com".into())),
            establishment_representative: Signatory::new(
                "Linus".into(),
                "linus@example.com".into(),
            ),
        }
    }

    #[test]
    fn status_wire_names_roundtrip() {
        for status in ConventionStatus::ALL {
            assert_eq!(ConventionStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(ConventionStatus::parse("SIGNED").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConventionStatus::AcceptedByValidator.is_terminal());
        assert!(ConventionStatus::Rejected.is_terminal());
        assert!(ConventionStatus::Cancelled.is_terminal());
        assert!(ConventionStatus::Deprecated.is_terminal());
        assert!(!ConventionStatus::InReview.is_terminal());
    }

    #[test]
    fn all_signed_ignores_absent_representative() {
        let mut parties = signatories(false);
        assert!(!parties.any_signed());
        assert!(parties.sign(SignatoryRole::Beneficiary, Utc::now()));
        assert!(!parties.all_signed());
        assert!(parties.sign(SignatoryRole::EstablishmentRepresentative, Utc::now()));
        assert!(parties.all_signed());
    }

    #[test]
    fn representative_signature_is_required_when_present() {
        let mut parties = signatories(true);
        parties.sign(SignatoryRole::Beneficiary, Utc::now());
        parties.sign(SignatoryRole::EstablishmentRepresentative, Utc::now());
        assert!(!parties.all_signed());
        parties.sign(SignatoryRole::BeneficiaryRepresentative, Utc::now());
        assert!(parties.all_signed());
    }

    #[test]
    fn signing_without_a_slot_is_refused() {
        let mut parties = signatories(false);
        assert!(!parties.sign(SignatoryRole::BeneficiaryRepresentative, Utc::now()));
    }
}
