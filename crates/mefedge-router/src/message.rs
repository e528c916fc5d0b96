//! Wire envelope exchanged with the cloud transport.
//!
//! The envelope carries two generations of route fields: the older
//! form addresses with `{group, operation}` and the newer one with
//! `{destination, option}`. Both are kept on the struct; the
//! normalizer mirrors one into the other so handlers only ever look
//! at the accessor methods.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const OP_GET: &str = "get";
pub const OP_UPDATE: &str = "update";
pub const OP_DELETE: &str = "delete";
pub const OP_RESTART: &str = "restart";
pub const OP_QUERY: &str = "query";
pub const OP_RESPONSE: &str = "response";
pub const OP_ERROR: &str = "error";
pub const OP_REPORT: &str = "report";
pub const OP_RAW: &str = "raw";

/// Closed set of recognized operations.
pub const OPERATIONS: [&str; 9] = [
    OP_GET,
    OP_UPDATE,
    OP_DELETE,
    OP_RESTART,
    OP_QUERY,
    OP_RESPONSE,
    OP_ERROR,
    OP_REPORT,
    OP_RAW,
];

pub const SOURCE_LOCAL: &str = "device_om";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default)]
    pub sync: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Transport-internal. Stripped before a message leaves the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    /// Transport-internal. Stripped before a message leaves the node.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_info: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub option: String,
    #[serde(default)]
    pub resource: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub header: Header,
    #[serde(default)]
    pub route: Route,
    #[serde(default)]
    pub content: Value,
}

impl Message {
    /// Build a fresh request with both route forms filled in.
    pub fn request(
        source: &str,
        destination: &str,
        operation: &str,
        resource: &str,
        content: Value,
    ) -> Self {
        Message {
            header: Header {
                id: Uuid::new_v4().to_string(),
                timestamp: Utc::now().timestamp_millis(),
                ..Header::default()
            },
            route: Route {
                source: source.to_string(),
                destination: destination.to_string(),
                group: destination.to_string(),
                operation: operation.to_string(),
                option: operation.to_string(),
                resource: resource.to_string(),
            },
            content,
        }
    }

    /// Build the response for this message: new id, `parentId` set to
    /// this id, endpoints swapped and operation set to `response`.
    pub fn response_to(&self, content: Value) -> Self {
        self.reply(OP_RESPONSE, content)
    }

    /// Like [`Message::response_to`] but flagged as an error reply.
    pub fn error_to(&self, content: Value) -> Self {
        self.reply(OP_ERROR, content)
    }

    fn reply(&self, operation: &str, content: Value) -> Self {
        Message {
            header: Header {
                id: Uuid::new_v4().to_string(),
                parent_id: self.header.id.clone(),
                sync: self.header.sync,
                version: self.header.version.clone(),
                timestamp: Utc::now().timestamp_millis(),
                ..Header::default()
            },
            route: Route {
                source: self.destination().to_string(),
                destination: self.route.source.clone(),
                group: self.route.source.clone(),
                operation: operation.to_string(),
                option: operation.to_string(),
                resource: self.route.resource.clone(),
            },
            content,
        }
    }

    /// Effective operation, preferring the newer route form.
    pub fn operation(&self) -> &str {
        if self.route.option.is_empty() {
            &self.route.operation
        } else {
            &self.route.option
        }
    }

    /// Effective destination, preferring the newer route form.
    pub fn destination(&self) -> &str {
        if self.route.destination.is_empty() {
            &self.route.group
        } else {
            &self.route.destination
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.operation(), OP_RESPONSE | OP_ERROR)
    }

    /// Deserialize the content into a concrete payload type.
    pub fn content_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── envelope ──

    #[test]
    fn request_fills_both_route_forms() {
        let msg = Message::request(SOURCE_LOCAL, "cloud", OP_UPDATE, "node/edge-1", json!({}));
        assert!(!msg.header.id.is_empty());
        assert_eq!(msg.route.operation, msg.route.option);
        assert_eq!(msg.route.group, msg.route.destination);
        assert_eq!(msg.operation(), OP_UPDATE);
    }

    #[test]
    fn response_links_parent_and_swaps_endpoints() {
        let req = Message::request("cloud", SOURCE_LOCAL, OP_GET, "/system/ca/Inner", json!({}));
        let resp = req.response_to(json!({"status": 0}));
        assert_eq!(resp.header.parent_id, req.header.id);
        assert_ne!(resp.header.id, req.header.id);
        assert_eq!(resp.route.source, SOURCE_LOCAL);
        assert_eq!(resp.route.destination, "cloud");
        assert!(resp.is_response());
    }

    #[test]
    fn older_route_form_deserializes() {
        let raw = json!({
            "header": {"id": "m-1", "timestamp": 1},
            "route": {"source": "cloud", "group": "om", "operation": "get", "resource": "/system/ca/Inner"},
            "content": "OK"
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.operation(), OP_GET);
        assert_eq!(msg.destination(), "om");
        assert_eq!(msg.content, json!("OK"));
    }

    #[test]
    fn transport_internal_fields_are_not_serialized_when_empty() {
        let msg = Message::request(SOURCE_LOCAL, "cloud", OP_REPORT, "pod-status", json!([]));
        let raw = serde_json::to_value(&msg).unwrap();
        assert!(raw["header"].get("nodeId").is_none());
        assert!(raw["header"].get("peerInfo").is_none());
    }
}
