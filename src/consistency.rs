//! Consistency validation for one aggregate's event sequence.
//!
//! Consistency means: every event belongs to the same aggregate, and the
//! event versions form a contiguous ascending run starting at the
//! aggregate's current version plus one.

use uuid::Uuid;

use crate::aggregate::AggregateRef;
use crate::event::Event;

/// A consistency violation. Every variant names the offending aggregate so
/// per-aggregate errors stay attributable after fan-in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    /// An event belongs to a different aggregate than the one being
    /// validated, or to no aggregate at all.
    #[error("aggregate identity mismatch: expected {expected}, event {event_id} belongs to {actual}", actual = fmt_ref(.got))]
    IdentityMismatch {
        expected: AggregateRef,
        got: Option<AggregateRef>,
        event_id: Uuid,
    },

    /// The first event's version does not continue the aggregate's current
    /// version.
    #[error("{reference}: unexpected start version: expected {expected}, got {got}")]
    UnexpectedStartVersion {
        reference: AggregateRef,
        expected: u64,
        got: u64,
    },

    /// Two consecutive events are not exactly one version apart. Duplicate
    /// versions surface here with `got < expected`.
    #[error("{reference}: version gap at event {at}: expected {expected}, got {got}")]
    VersionGap {
        reference: AggregateRef,
        /// Zero-based index of the offending event.
        at: usize,
        expected: u64,
        got: u64,
    },
}

impl ConsistencyError {
    /// The aggregate the violation belongs to.
    pub fn reference(&self) -> &AggregateRef {
        match self {
            Self::IdentityMismatch { expected, .. } => expected,
            Self::UnexpectedStartVersion { reference, .. } => reference,
            Self::VersionGap { reference, .. } => reference,
        }
    }
}

fn fmt_ref(got: &Option<AggregateRef>) -> String {
    match got {
        Some(r) => r.to_string(),
        None => "no aggregate".to_string(),
    }
}

/// Validate `events` against the aggregate identified by `reference` at
/// `current_version`.
///
/// `events` is assumed sorted ascending by aggregate version. The check is
/// pure, never mutates its inputs, and fails on the first violation:
///
/// 1. every event's aggregate tuple matches `reference`;
/// 2. the first event's version is `current_version + 1`;
/// 3. each further event's version is its predecessor's plus one.
pub fn validate(
    reference: &AggregateRef,
    current_version: u64,
    events: &[Event],
) -> Result<(), ConsistencyError> {
    let mut prev_version: Option<u64> = None;

    for (i, evt) in events.iter().enumerate() {
        let tuple = match evt.aggregate() {
            Some(tuple) if tuple.name == reference.name() && tuple.id == reference.id() => tuple,
            other => {
                return Err(ConsistencyError::IdentityMismatch {
                    expected: reference.clone(),
                    got: other.map(|t| t.reference()),
                    event_id: evt.id(),
                });
            }
        };

        match prev_version {
            None => {
                let expected = current_version + 1;
                if tuple.version != expected {
                    return Err(ConsistencyError::UnexpectedStartVersion {
                        reference: reference.clone(),
                        expected,
                        got: tuple.version,
                    });
                }
            }
            Some(prev) => {
                let expected = prev + 1;
                if tuple.version != expected {
                    return Err(ConsistencyError::VersionGap {
                        reference: reference.clone(),
                        at: i,
                        expected,
                        got: tuple.version,
                    });
                }
            }
        }
        prev_version = Some(tuple.version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_fixtures::{aggregate_events, versioned_events};

    #[test]
    fn contiguous_run_from_fresh_aggregate_passes() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = aggregate_events("foo", id, 3);

        validate(&reference, 0, &events).expect("contiguous run should validate");
    }

    #[test]
    fn continuation_of_existing_version_passes() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = versioned_events("foo", id, vec![4, 5, 6]);

        validate(&reference, 3, &events).expect("continuation should validate");
    }

    #[test]
    fn empty_sequence_passes() {
        let reference = AggregateRef::new("foo", Uuid::new_v4());
        validate(&reference, 7, &[]).expect("empty sequence should validate");
    }

    #[test]
    fn wrong_aggregate_name_is_identity_mismatch() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = aggregate_events("bar", id, 1);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        match err {
            ConsistencyError::IdentityMismatch { expected, got, .. } => {
                assert_eq!(expected, reference);
                assert_eq!(got, Some(AggregateRef::new("bar", id)));
            }
            other => panic!("expected IdentityMismatch, got {other:?}"),
        }
    }

    #[test]
    fn missing_aggregate_tuple_is_identity_mismatch() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = vec![crate::event::Event::new("evt", ())];

        let err = validate(&reference, 0, &events).expect_err("should fail");
        match err {
            ConsistencyError::IdentityMismatch { got, .. } => assert_eq!(got, None),
            other => panic!("expected IdentityMismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_start_version_is_reported() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = versioned_events("foo", id, vec![2, 3]);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        assert_eq!(
            err,
            ConsistencyError::UnexpectedStartVersion {
                reference: reference.clone(),
                expected: 1,
                got: 2,
            }
        );
    }

    #[test]
    fn version_gap_names_index_and_versions() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        // Versions 1, 2, 4: the gap is at index 2, where 3 was expected.
        let events = versioned_events("foo", id, vec![1, 2, 4]);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        assert_eq!(
            err,
            ConsistencyError::VersionGap {
                reference: reference.clone(),
                at: 2,
                expected: 3,
                got: 4,
            }
        );
    }

    #[test]
    fn duplicate_version_is_a_gap() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = versioned_events("foo", id, vec![1, 1, 2]);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        assert_eq!(
            err,
            ConsistencyError::VersionGap {
                reference: reference.clone(),
                at: 1,
                expected: 2,
                got: 1,
            }
        );
    }

    #[test]
    fn fails_on_first_violation_only() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        // Both a start-version violation and a later gap; the start wins.
        let events = versioned_events("foo", id, vec![3, 7]);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        assert!(
            matches!(err, ConsistencyError::UnexpectedStartVersion { .. }),
            "first violation should be reported, got {err:?}"
        );
    }

    #[test]
    fn error_exposes_offending_reference() {
        let id = Uuid::new_v4();
        let reference = AggregateRef::new("foo", id);
        let events = versioned_events("foo", id, vec![2]);

        let err = validate(&reference, 0, &events).expect_err("should fail");
        assert_eq!(err.reference(), &reference);
    }
}
