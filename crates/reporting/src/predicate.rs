//! Event predicates — the tagged union describing which events qualify an
//! actor for a cohort or count as retention activity.
//!
//! New predicate kinds can be added here without touching aggregation
//! logic; the aggregators only call [`EventPredicate::matches`] or, for
//! sequences, inspect the two step names.

use serde::{Deserialize, Serialize};

use clubroom_core::types::EventRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventPredicate {
    /// Matches one literal event type.
    Literal { event_type: String },
    /// Composite "virtual" event: a `first` event confirmed by a strictly
    /// later `then` event inside the same window. Matching an individual
    /// record only checks the `first` step; the cohort builder applies the
    /// confirmation constraint.
    Sequence { first: String, then: String },
    /// Matches any event type except the listed synthetic names.
    Any { exclude: Vec<String> },
}

impl EventPredicate {
    pub fn literal(event_type: impl Into<String>) -> Self {
        EventPredicate::Literal {
            event_type: event_type.into(),
        }
    }

    pub fn sequence(first: impl Into<String>, then: impl Into<String>) -> Self {
        EventPredicate::Sequence {
            first: first.into(),
            then: then.into(),
        }
    }

    pub fn any() -> Self {
        EventPredicate::Any {
            exclude: Vec::new(),
        }
    }

    pub fn any_except(exclude: Vec<String>) -> Self {
        EventPredicate::Any { exclude }
    }

    /// Whether a single record matches this predicate, ignoring the
    /// sequence-confirmation constraint.
    pub fn matches(&self, event: &EventRecord) -> bool {
        match self {
            EventPredicate::Literal { event_type } => event.event_type == *event_type,
            EventPredicate::Sequence { first, .. } => event.event_type == *first,
            EventPredicate::Any { exclude } => !exclude.contains(&event.event_type),
        }
    }

    /// The event types a store query needs to fetch for this predicate,
    /// or `None` when every type is required.
    pub fn query_types(&self) -> Option<Vec<String>> {
        match self {
            EventPredicate::Literal { event_type } => Some(vec![event_type.clone()]),
            EventPredicate::Sequence { first, then } => {
                Some(vec![first.clone(), then.clone()])
            }
            EventPredicate::Any { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ev(kind: &str) -> EventRecord {
        EventRecord::new("actor", kind, Utc::now())
    }

    #[test]
    fn test_literal_match() {
        let p = EventPredicate::literal("register");
        assert!(p.matches(&ev("register")));
        assert!(!p.matches(&ev("pageview")));
    }

    #[test]
    fn test_sequence_matches_first_step_only() {
        let p = EventPredicate::sequence("register", "verified");
        assert!(p.matches(&ev("register")));
        assert!(!p.matches(&ev("verified")));
    }

    #[test]
    fn test_wildcard_with_exclusions() {
        let p = EventPredicate::any_except(vec!["heartbeat".into()]);
        assert!(p.matches(&ev("room_participate")));
        assert!(!p.matches(&ev("heartbeat")));
    }
}
