//! Domain events and the outbox record that carries them.
//!
//! Every successful transition emits one or more [`ConventionEvent`]s. An
//! event is an immutable fact: it carries the full convention snapshot at
//! the time of the transition (not a diff), so subscribers never need to
//! query the aggregate back. The payload shape is fully determined by the
//! topic: the tagged union makes an event with the wrong shape
//! unrepresentable.
//!
//! Events are serialized as JSON with a `"topic"` tag, which is also the
//! stable wire name stored in the outbox `topic` column.

use crate::convention::{Convention, SignatoryRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an outbox event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
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

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed taxonomy of event kinds.
///
/// Each transition emits a topic specific to that transition, never a
/// generic "status changed", because subscribers are registered per topic
/// and depend on the topic-specific payload shape.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// The draft was completed and opened for signatures.
    ConventionReadyToSign,
    /// The beneficiary signed.
    BeneficiarySigned,
    /// The beneficiary's legal representative signed.
    BeneficiaryRepresentativeSigned,
    /// The establishment representative signed.
    EstablishmentRepresentativeSigned,
    /// The last required signature arrived.
    ConventionFullySigned,
    /// An agency counsellor accepted the convention.
    ConventionAcceptedByCounsellor,
    /// An agency validator gave the final approval.
    ConventionAcceptedByValidator,
    /// The agency rejected the convention.
    ConventionRejected,
    /// A party cancelled the convention before review completed.
    ConventionCancelled,
    /// The convention was administratively retired.
    ConventionDeprecated,
}

impl Topic {
    /// Every topic in the taxonomy.
    pub const ALL: [Self; 10] = [
        Self::ConventionReadyToSign,
        Self::BeneficiarySigned,
        Self::BeneficiaryRepresentativeSigned,
        Self::EstablishmentRepresentativeSigned,
        Self::ConventionFullySigned,
        Self::ConventionAcceptedByCounsellor,
        Self::ConventionAcceptedByValidator,
        Self::ConventionRejected,
        Self::ConventionCancelled,
        Self::ConventionDeprecated,
    ];

    /// Stable wire name, identical to the serde tag of the payload union.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConventionReadyToSign => "ConventionReadyToSign",
            Self::BeneficiarySigned => "BeneficiarySigned",
            Self::BeneficiaryRepresentativeSigned => "BeneficiaryRepresentativeSigned",
            Self::EstablishmentRepresentativeSigned => "EstablishmentRepresentativeSigned",
            Self::ConventionFullySigned => "ConventionFullySigned",
            Self::ConventionAcceptedByCounsellor => "ConventionAcceptedByCounsellor",
            Self::ConventionAcceptedByValidator => "ConventionAcceptedByValidator",
            Self::ConventionRejected => "ConventionRejected",
            Self::ConventionCancelled => "ConventionCancelled",
            Self::ConventionDeprecated => "ConventionDeprecated",
        }
    }

    /// Parse a topic from its wire name.
    ///
    /// # Errors
    ///
    /// Returns the unrecognised input when it matches no known topic.
    pub fn parse(s: &str) -> Result<Self, String> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| format!("unknown topic: {s}"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event: topic plus the payload that topic mandates.
///
/// The serde representation uses the topic name as the tag, so the
/// persisted JSON is self-describing and the outbox `topic` column is
/// derivable from the payload alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic")]
pub enum ConventionEvent {
    /// See [`Topic::ConventionReadyToSign`].
    ConventionReadyToSign {
        /// Snapshot after the transition.
        convention: Convention,
    },
    /// See [`Topic::BeneficiarySigned`].
    BeneficiarySigned {
        /// Snapshot after the transition.
        convention: Convention,
        /// When the signature was recorded.
        signed_at: DateTime<Utc>,
    },
    /// See [`Topic::BeneficiaryRepresentativeSigned`].
    BeneficiaryRepresentativeSigned {
        /// Snapshot after the transition.
        convention: Convention,
        /// When the signature was recorded.
        signed_at: DateTime<Utc>,
    },
    /// See [`Topic::EstablishmentRepresentativeSigned`].
    EstablishmentRepresentativeSigned {
        /// Snapshot after the transition.
        convention: Convention,
        /// When the signature was recorded.
        signed_at: DateTime<Utc>,
    },
    /// See [`Topic::ConventionFullySigned`].
    ConventionFullySigned {
        /// Snapshot after the transition.
        convention: Convention,
    },
    /// See [`Topic::ConventionAcceptedByCounsellor`].
    ConventionAcceptedByCounsellor {
        /// Snapshot after the transition.
        convention: Convention,
    },
    /// See [`Topic::ConventionAcceptedByValidator`].
    ConventionAcceptedByValidator {
        /// Snapshot after the transition.
        convention: Convention,
    },
    /// See [`Topic::ConventionRejected`].
    ConventionRejected {
        /// Snapshot after the transition.
        convention: Convention,
        /// Why the agency rejected it.
        justification: String,
    },
    /// See [`Topic::ConventionCancelled`].
    ConventionCancelled {
        /// Snapshot after the transition.
        convention: Convention,
    },
    /// See [`Topic::ConventionDeprecated`].
    ConventionDeprecated {
        /// Snapshot after the transition.
        convention: Convention,
        /// Why the convention was retired.
        justification: String,
    },
}

impl ConventionEvent {
    /// The topic this payload belongs to.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::ConventionReadyToSign { .. } => Topic::ConventionReadyToSign,
            Self::BeneficiarySigned { .. } => Topic::BeneficiarySigned,
            Self::BeneficiaryRepresentativeSigned { .. } => Topic::BeneficiaryRepresentativeSigned,
            Self::EstablishmentRepresentativeSigned { .. } => {
                Topic::EstablishmentRepresentativeSigned
            }
            Self::ConventionFullySigned { .. } => Topic::ConventionFullySigned,
            Self::ConventionAcceptedByCounsellor { .. } => Topic::ConventionAcceptedByCounsellor,
            Self::ConventionAcceptedByValidator { .. } => Topic::ConventionAcceptedByValidator,
            Self::ConventionRejected { .. } => Topic::ConventionRejected,
            Self::ConventionCancelled { .. } => Topic::ConventionCancelled,
            Self::ConventionDeprecated { .. } => Topic::ConventionDeprecated,
        }
    }

    /// The convention snapshot every payload carries.
    #[must_use]
    pub const fn convention(&self) -> &Convention {
        match self {
            Self::ConventionReadyToSign { convention }
            | Self::BeneficiarySigned { convention, .. }
            | Self::BeneficiaryRepresentativeSigned { convention, .. }
            | Self::EstablishmentRepresentativeSigned { convention, .. }
            | Self::ConventionFullySigned { convention }
            | Self::ConventionAcceptedByCounsellor { convention }
            | Self::ConventionAcceptedByValidator { convention }
            | Self::ConventionRejected { convention, .. }
            | Self::ConventionCancelled { convention }
            | Self::ConventionDeprecated { convention, .. } => convention,
        }
    }

    /// The signed topic corresponding to a signatory role.
    #[must_use]
    pub const fn signed_topic(role: SignatoryRole) -> Topic {
        match role {
            SignatoryRole::Beneficiary => Topic::BeneficiarySigned,
            SignatoryRole::BeneficiaryRepresentative => Topic::BeneficiaryRepresentativeSigned,
            SignatoryRole::EstablishmentRepresentative => {
                Topic::EstablishmentRepresentativeSigned
            }
        }
    }
}

/// Delivery lifecycle of an outbox event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventStatus {
    /// Appended, not yet claimed by any engine instance.
    NeverPublished,
    /// Claimed by an engine instance; reclaimable after the lease expires.
    InProcess,
    /// Manually queued for replay by an operator.
    ToRepublish,
    /// Every subscriber succeeded; a publication row exists.
    Published,
    /// Some subscribers failed; the retry budget is not exhausted.
    FailedButWillRetry,
    /// Quarantined: the retry budget is exhausted. Excluded from automatic
    /// claims until an operator requeues it.
    FailedTooManyTimes,
}

impl EventStatus {
    /// Stable wire name used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NeverPublished => "never-published",
            Self::InProcess => "in-process",
            Self::ToRepublish => "to-republish",
            Self::Published => "published",
            Self::FailedButWillRetry => "failed-but-will-retry",
            Self::FailedTooManyTimes => "failed-to-many-times",
        }
    }

    /// Parse a status from its wire name.
    ///
    /// # Errors
    ///
    /// Returns the unrecognised input when it matches no known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "never-published" => Ok(Self::NeverPublished),
            "in-process" => Ok(Self::InProcess),
            "to-republish" => Ok(Self::ToRepublish),
            "published" => Ok(Self::Published),
            "failed-but-will-retry" => Ok(Self::FailedButWillRetry),
            "failed-to-many-times" => Ok(Self::FailedTooManyTimes),
            _ => Err(format!("unknown event status: {s}")),
        }
    }

    /// Whether an engine instance may claim an event in this status.
    ///
    /// `InProcess` is claimable only once its lease expired, which the
    /// store checks against `claimed_at`; quarantined and published events
    /// are never claimed automatically.
    #[must_use]
    pub const fn is_eligible_for_claim(&self) -> bool {
        matches!(
            self,
            Self::NeverPublished | Self::ToRepublish | Self::FailedButWillRetry
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted outbox event: the payload plus delivery bookkeeping.
///
/// Records are created by a successful transition (inside the same atomic
/// unit as the convention mutation), mutated only by the delivery engine or
/// an operator requeue, and never deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxRecord {
    /// Unique identifier.
    pub id: EventId,
    /// The topic-tagged payload.
    pub payload: ConventionEvent,
    /// When the underlying fact happened.
    pub occurred_at: DateTime<Utc>,
    /// Current delivery lifecycle status.
    pub status: EventStatus,
    /// Number of failed delivery attempts so far.
    pub attempts: u32,
    /// When the current `InProcess` claim was taken, if any.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Creates a fresh, never-published record for a payload.
    #[must_use]
    pub fn new(payload: ConventionEvent, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            payload,
            occurred_at,
            status: EventStatus::NeverPublished,
            attempts: 0,
            claimed_at: None,
        }
    }

    /// Shorthand for the payload's topic.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

/// Marks that an event's fan-out completed: at most one per event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
    /// Unique identifier.
    pub id: Uuid,
    /// The event whose fan-out completed.
    pub event_id: EventId,
    /// When the last subscriber succeeded.
    pub published_at: DateTime<Utc>,
}

/// One subscriber's failure during an event's fan-out.
///
/// Failure rows are what lets a retry target only the subscribers still
/// owed, instead of re-running the whole fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Unique identifier.
    pub id: Uuid,
    /// The event whose fan-out encountered this failure.
    pub event_id: EventId,
    /// Name of the subscriber that failed.
    pub subscription_id: String,
    /// The error the subscriber reported.
    pub error_message: String,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}
