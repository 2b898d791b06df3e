//! Endpoint lookup inside a peer's endpoint tree

use mbridge_stack::PeerEndpoint;
use std::sync::Arc;

/// Find the endpoint numbered `number` below (and including) `roots`
///
/// Depth-first, pre-order: every endpoint is checked before its children, and
/// children are visited in enumeration order. The first match wins.
pub fn find_endpoint(
    roots: Vec<Arc<dyn PeerEndpoint>>,
    number: u16,
) -> Option<Arc<dyn PeerEndpoint>> {
    // Reversed so the leftmost endpoint is popped first
    let mut pending: Vec<Arc<dyn PeerEndpoint>> = roots.into_iter().rev().collect();
    while let Some(endpoint) = pending.pop() {
        if endpoint.number() == number {
            return Some(endpoint);
        }
        pending.extend(endpoint.child_endpoints().into_iter().rev());
    }
    None
}
