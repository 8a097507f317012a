//! Last-Writer-Wins field assignment.
//!
//! Every mergeable item field is stored next to the timestamp of the event
//! that last set it. A write is accepted when its timestamp is greater than
//! *or equal to* the recorded one: on a tie, whichever event is processed
//! later wins. That tie-break is order dependent, and it is kept that way on
//! purpose: same-millisecond writes to the same field from two replicas are
//! rare, and breaking ties by author or event id would change which value
//! existing replicas already converged to.

use crate::clock::Timestamp;

/// Whether a write stamped `incoming` may replace a value stamped `current`.
#[inline]
pub fn accepts(current: Timestamp, incoming: Timestamp) -> bool {
    incoming >= current
}

/// Assign `value` to `slot` under the LWW rule, moving the stamp with it.
///
/// Returns `true` if the write was applied.
pub fn assign<T>(slot: &mut T, stamp: &mut Timestamp, value: T, at: Timestamp) -> bool {
    if !accepts(*stamp, at) {
        return false;
    }
    *slot = value;
    *stamp = at;
    true
}
