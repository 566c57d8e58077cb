//! Participant-set derivation and diffing.
//!
//! Pure functions over an [`AnnouncementView`]; the session actor decides what
//! to do with the result.

use crate::announcement::{AnnouncementView, CallDescriptor};
use common::types::{ParticipantId, SessionId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Difference between two participant sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub joined: BTreeSet<ParticipantId>,
    pub left: BTreeSet<ParticipantId>,
}

impl MembershipDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Candidate participants: the local identity plus every identity with a
/// live, matching announcement, each mapped to its announced session.
///
/// The local identity always maps to `local_session`. An announcement for the
/// local identity carrying another session id is a second registration of
/// this device; it is not added as a separate participant.
#[must_use]
pub fn candidate_participants(
    local: &ParticipantId,
    local_session: &SessionId,
    view: &AnnouncementView,
    descriptor: &CallDescriptor,
    now_ms: i64,
) -> BTreeMap<ParticipantId, SessionId> {
    let mut members = view.members_of(descriptor, now_ms);

    if let Some(announced) = members.get(local) {
        if announced != local_session {
            warn!(
                target: "call.membership",
                participant = %local,
                local_session = %local_session,
                announced_session = %announced,
                "Local identity announced with a different session, ignoring"
            );
        }
    }
    members.insert(local.clone(), local_session.clone());

    members
}

/// `joined = new - old`, `left = old - new`.
#[must_use]
pub fn diff(old: &BTreeSet<ParticipantId>, new: &BTreeSet<ParticipantId>) -> MembershipDiff {
    MembershipDiff {
        joined: new.difference(old).cloned().collect(),
        left: old.difference(new).cloned().collect(),
    }
}
