//! Operation log: attributes cloud responses to the request that
//! caused them and emits one audit line per state change.
//!
//! Requests enter a bounded ring; responses are matched newest-first
//! by `parentId` and removed. The ring and the captured peer address
//! are guarded by separate mutexes so a slow match never blocks the
//! address capture path.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Deserialize;

use crate::message::{Message, OP_ERROR, OP_RESTART, OP_UPDATE};

/// Ring capacity; the oldest record is evicted on overflow.
pub const OPLOG_RING_CAPACITY: usize = 600;

/// Resources exchanged between local modules only; never logged.
const INNER_MSG_WHITELIST: [&str; 2] = ["om-inner", "heartbeat"];

/// Periodic telemetry; logged nowhere, it would drown the audit log.
const SKIP_OPT_LOGGING: [&str; 3] = ["pod-status", "node-status", "image-cert-info"];

/// Resource whose first `update` carries the upstream peer address.
const ADDR_CAPTURE_RESOURCE: &str = "image-cert-info";

/// Cloud progress reports; logged by content, never matched.
const PROGRESS_RESOURCE: &str = "config-result";

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub header_id: String,
    pub operation: String,
    pub resource: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PeerAddr {
    ip: String,
    #[allow(dead_code)]
    port: String,
}

#[derive(Default)]
pub struct OpLog {
    ring: Mutex<VecDeque<OperationRecord>>,
    peer: Mutex<Option<PeerAddr>>,
}

enum OpResult {
    Start,
    Success,
    Failed,
    OptError,
}

impl OpResult {
    fn as_str(&self) -> &'static str {
        match self {
            OpResult::Start => "Start",
            OpResult::Success => "Success",
            OpResult::Failed => "Failed",
            OpResult::OptError => "OptError",
        }
    }
}

impl OpLog {
    pub fn new() -> Self {
        OpLog::default()
    }

    /// Observe one inbound message. Requests are recorded and get a
    /// `Start` line; responses are matched against the ring and get
    /// their result line.
    pub fn observe(&self, msg: &Message) {
        let resource = msg.route.resource.as_str();
        if INNER_MSG_WHITELIST.contains(&resource) {
            return;
        }
        if resource == ADDR_CAPTURE_RESOURCE && msg.operation() == OP_UPDATE {
            self.capture_peer(msg);
        }
        if resource == PROGRESS_RESOURCE {
            self.log_progress(msg);
            return;
        }
        if SKIP_OPT_LOGGING.contains(&resource) {
            return;
        }
        if msg.is_response() {
            self.observe_response(msg);
        } else {
            self.observe_request(msg);
        }
    }

    fn observe_request(&self, msg: &Message) {
        let record = OperationRecord {
            header_id: msg.header.id.clone(),
            operation: msg.operation().to_string(),
            resource: msg.route.resource.clone(),
        };
        self.log_line(&record, &msg.header.id, OpResult::Start);

        // Pod restarts have no matching response; log Start only.
        if record.operation == OP_RESTART && record.resource.starts_with("/pod") {
            return;
        }
        let mut ring = lock(&self.ring);
        if ring.len() >= OPLOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    fn observe_response(&self, msg: &Message) {
        if msg.header.parent_id.is_empty() {
            return;
        }
        let Some(record) = self.match_response(&msg.header.parent_id) else {
            return;
        };
        let result = if msg.operation() == OP_ERROR {
            OpResult::OptError
        } else if msg.content == serde_json::Value::String("OK".to_string()) {
            OpResult::Success
        } else if msg
            .content
            .get("status")
            .and_then(serde_json::Value::as_u64)
            == Some(0)
        {
            OpResult::Success
        } else {
            OpResult::Failed
        };
        self.log_line(&record, &msg.header.parent_id, result);
    }

    /// Report the outcome of a locally handled request. Local
    /// handlers answer in-process, so their result never comes back
    /// through [`OpLog::observe`].
    pub fn observe_local_result(&self, request: &Message, success: bool) {
        let resource = request.route.resource.as_str();
        if INNER_MSG_WHITELIST.contains(&resource) || SKIP_OPT_LOGGING.contains(&resource) {
            return;
        }
        let Some(record) = self.match_response(&request.header.id) else {
            return;
        };
        let result = if success {
            OpResult::Success
        } else {
            OpResult::Failed
        };
        self.log_line(&record, &request.header.id, result);
    }

    /// Remove and return the newest record with this header id.
    pub fn match_response(&self, parent_id: &str) -> Option<OperationRecord> {
        let mut ring = lock(&self.ring);
        let idx = ring
            .iter()
            .rposition(|record| record.header_id == parent_id)?;
        ring.remove(idx)
    }

    fn capture_peer(&self, msg: &Message) {
        let mut peer = lock(&self.peer);
        if peer.is_some() {
            return;
        }
        match msg.content_as::<PeerAddr>() {
            Ok(addr) => {
                tracing::info!(ip = %addr.ip, "captured upstream peer address");
                *peer = Some(addr);
            }
            Err(err) => {
                tracing::warn!(error = %err, "peer address payload did not parse");
            }
        }
    }

    /// Address of the upstream peer, once captured.
    pub fn peer_ip(&self) -> Option<String> {
        lock(&self.peer).as_ref().map(|p| p.ip.clone())
    }

    fn log_progress(&self, msg: &Message) {
        let topic = msg
            .content
            .get("topic")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        let result = msg
            .content
            .get("result")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        tracing::info!(target: "oplog", topic, result, "config progress");
    }

    fn log_line(&self, record: &OperationRecord, id: &str, result: OpResult) {
        let from = self.peer_ip().unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            target: "oplog",
            "[device_om@local] {} {} {}, the message(id:{}) is forwarded from [FD:{}]",
            record.operation,
            record.resource,
            result.as_str(),
            id,
            from,
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.ring).len()
    }

    #[cfg(test)]
    fn oldest_id(&self) -> Option<String> {
        lock(&self.ring).front().map(|r| r.header_id.clone())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, OP_RESPONSE, OP_UPDATE};
    use serde_json::json;

    fn request(id: &str, operation: &str, resource: &str) -> Message {
        let mut msg = Message::request("cloud", "om", operation, resource, json!({}));
        msg.header.id = id.to_string();
        msg
    }

    fn response(parent: &str, content: serde_json::Value) -> Message {
        let mut msg = Message::default();
        msg.header.parent_id = parent.to_string();
        msg.route.option = OP_RESPONSE.to_string();
        msg.content = content;
        msg
    }

    // ── ring bounds ──

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let log = OpLog::new();
        for i in 0..OPLOG_RING_CAPACITY + 1 {
            log.observe(&request(&format!("id-{i}"), OP_UPDATE, "/pod"));
        }
        assert_eq!(log.len(), OPLOG_RING_CAPACITY);
        assert_eq!(log.oldest_id().as_deref(), Some("id-1"));
    }

    // ── response matching ──

    #[test]
    fn response_removes_matching_record() {
        let log = OpLog::new();
        log.observe(&request("h1", OP_UPDATE, "/pod"));
        assert_eq!(log.len(), 1);

        log.observe(&response("h1", json!("OK")));
        assert_eq!(log.len(), 0);
        assert!(log.match_response("h1").is_none());
    }

    #[test]
    fn duplicate_header_ids_match_newest_first() {
        let log = OpLog::new();
        log.observe(&request("h1", OP_UPDATE, "/pod"));
        log.observe(&request("h1", OP_UPDATE, "/net-config"));

        let matched = log.match_response("h1").unwrap();
        assert_eq!(matched.resource, "/net-config");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn matched_record_keeps_request_attribution() {
        let log = OpLog::new();
        log.observe(&request("h1", OP_UPDATE, "/pod"));
        log.observe(&request("h2", "delete", "/system/ca"));

        let matched = log.match_response("h1").unwrap();
        assert_eq!(matched.operation, OP_UPDATE);
        assert_eq!(matched.resource, "/pod");
    }

    // ── whitelists ──

    #[test]
    fn skipped_resources_never_enter_the_ring() {
        let log = OpLog::new();
        log.observe(&request("h1", OP_UPDATE, "node-status"));
        log.observe(&request("h2", OP_UPDATE, "om-inner"));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn pod_restart_is_not_recorded_for_matching() {
        let log = OpLog::new();
        log.observe(&request("h1", "restart", "/pod/abc"));
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn config_result_is_logged_without_matching() {
        let log = OpLog::new();
        let mut msg = request("h1", OP_UPDATE, "config-result");
        msg.content = json!({"topic": "netManager", "result": "success"});
        log.observe(&msg);
        assert_eq!(log.len(), 0);
    }

    // ── peer capture ──

    #[test]
    fn first_image_cert_info_captures_peer() {
        let log = OpLog::new();
        let msg = request("h1", OP_UPDATE, "image-cert-info");
        let mut msg = msg;
        msg.content = json!({"ip": "10.0.0.5", "port": "8443"});
        log.observe(&msg);
        assert_eq!(log.peer_ip().as_deref(), Some("10.0.0.5"));

        // later captures do not overwrite the first
        let mut other = request("h2", OP_UPDATE, "image-cert-info");
        other.content = json!({"ip": "10.9.9.9", "port": "1"});
        log.observe(&other);
        assert_eq!(log.peer_ip().as_deref(), Some("10.0.0.5"));
    }
}
