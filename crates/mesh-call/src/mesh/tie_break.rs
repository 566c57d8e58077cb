//! Deterministic initiator selection.
//!
//! Both ends of a pair evaluate the same comparison with the arguments
//! swapped, so exactly one side initiates. The lesser identity initiates and
//! the greater one waits for its offer, falling back to initiating itself when
//! the wait times out. Identical identities are ordered by session id with a
//! shorter wait; a full match cannot be ordered and is escalated.
//!
//! The session-id level uses the same orientation as the identity level: the
//! lesser session initiates. Peers must agree on it, or a collision makes both
//! sides wait and then both initiate.

use common::types::{ParticipantId, SessionId};
use std::cmp::Ordering;
use std::time::Duration;

/// Outcome of the tie-break for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Send the offer now.
    Initiate,
    /// Wait for the remote's offer; initiate after `timeout` if none arrives.
    AwaitRemote { timeout: Duration },
    /// Identity and session both equal. No setup is attempted.
    Escalate,
}

#[must_use]
pub fn resolve(
    local: &ParticipantId,
    local_session: &SessionId,
    remote: &ParticipantId,
    remote_session: &SessionId,
    primary_timeout: Duration,
    secondary_timeout: Duration,
) -> TieBreak {
    match local.cmp(remote) {
        Ordering::Less => TieBreak::Initiate,
        Ordering::Greater => TieBreak::AwaitRemote {
            timeout: primary_timeout,
        },
        Ordering::Equal => match local_session.cmp(remote_session) {
            Ordering::Less => TieBreak::Initiate,
            Ordering::Greater => TieBreak::AwaitRemote {
                timeout: secondary_timeout,
            },
            Ordering::Equal => TieBreak::Escalate,
        },
    }
}
