//! Envelope normalization at the transport boundary.
//!
//! Upstreams still speak a mix of the two route forms. On the way in
//! the newer `{destination, option}` pair is authoritative and is
//! mirrored into `{group, operation}`; on the way out both forms are
//! kept in sync and the transport-internal header fields are zeroed
//! so they never leave the node.

use crate::message::Message;

/// Normalize an inbound message so handlers see both route forms
/// populated and agreeing.
pub fn msg_in_process(msg: &mut Message) {
    if !msg.route.destination.is_empty() {
        msg.route.group = msg.route.destination.clone();
    } else if !msg.route.group.is_empty() {
        msg.route.destination = msg.route.group.clone();
    }
    if !msg.route.option.is_empty() {
        msg.route.operation = msg.route.option.clone();
    } else if !msg.route.operation.is_empty() {
        msg.route.option = msg.route.operation.clone();
    }
}

/// Prepare an outbound message: mirror the route forms and strip
/// fields that only have meaning inside this node.
pub fn msg_out_process(msg: &mut Message) {
    msg_in_process(msg);
    msg.header.node_id.clear();
    msg.header.peer_info.clear();
}
