//! Local three-node reasoning
//!
//! Decides a link's state from the predecessor's and successor's constraints
//! alone. Devices never coordinate directly: one device's RECEIVE_REDIRECT is
//! paired with another's FETCH_FORWARD because both evaluate the same
//! constraint data.

use crate::context::{ConstraintSet, DeviceContext};

use super::{LinkCardinality, LinkState};

/// Compute the state this device should hold for an edge.
pub fn reason(
    context: &DeviceContext,
    predecessor: &ConstraintSet,
    successor: &ConstraintSet,
    cardinality: LinkCardinality,
) -> LinkState {
    // Every device runs an unconstrained predecessor.
    if !predecessor.is_constrained() {
        if !context.satisfies(successor) {
            return LinkState::Drop;
        }
        return local_delivery(cardinality);
    }

    // This device produces the edge's data.
    if context.satisfies(predecessor) {
        if !successor.is_constrained() || context.satisfies(successor) {
            return local_delivery(cardinality);
        }
        return LinkState::ReceiveRedirect;
    }

    // Nothing arrives from the predecessor here.
    if successor.is_constrained() && !context.satisfies(successor) {
        return LinkState::Drop;
    }
    LinkState::FetchForward
}

/// A fan point keeps serving its local branch while relaying on the bus.
fn local_delivery(cardinality: LinkCardinality) -> LinkState {
    match cardinality {
        LinkCardinality::OneToMany => LinkState::ReceiveRedirectCopy,
        LinkCardinality::ManyToOne => LinkState::CopyFetchForward,
        LinkCardinality::OneToOne | LinkCardinality::ManyToMany => LinkState::Normal,
    }
}
