//! Status synthesizers: build the periodic node-status and pod-status
//! reports from local state so the transport can forward them upstream.

use serde_json::{json, Value};

use mefedge_common::registry::ConfigRegistry;

use crate::error::RouterError;
use crate::message::{Message, OP_UPDATE, SOURCE_LOCAL};
use crate::normalize::msg_out_process;

/// Build a node-status report from the registry.
pub fn node_status(registry: &ConfigRegistry, destination: &str) -> Result<Message, RouterError> {
    let serial = registry
        .node_info("serial_number")?
        .unwrap_or_else(|| "unknown".to_string());
    let version = registry
        .node_info("inner_version")?
        .unwrap_or_else(|| "unknown".to_string());
    let content = json!({
        "serialNumber": serial,
        "innerVersion": version,
        "status": "ready",
    });

    let resource = format!("node/{serial}");
    let mut msg = Message::request(SOURCE_LOCAL, destination, OP_UPDATE, &resource, content);
    msg_out_process(&mut msg);
    Ok(msg)
}

/// Aggregate the pod records last pushed by the cloud into a
/// pod-status report. Missing state reports an empty list.
pub fn pod_status(registry: &ConfigRegistry, destination: &str) -> Result<Message, RouterError> {
    let pods: Value = registry
        .read_json("edge_main", "pods.json")
        .unwrap_or_else(|_| json!([]));
    let content = json!({ "pods": pods });

    let mut msg = Message::request(SOURCE_LOCAL, destination, OP_UPDATE, "pod-status", content);
    msg_out_process(&mut msg);
    Ok(msg)
}
