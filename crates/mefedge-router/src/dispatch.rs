//! Operation handler dispatcher.
//!
//! Handlers are registered explicitly at startup, keyed by
//! `(operation, resource)`. Parameterized resources are collapsed to
//! a placeholder key so `/system/ca/Inner` and `/system/ca/image`
//! share one handler. Execution is bounded by a worker pool and a
//! per-handler deadline; a handler never surfaces an error to the
//! transport, it answers with a `RespMsg`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use mefedge_common::error::RespCode;

use crate::message::Message;
use crate::normalize::{msg_in_process, msg_out_process};
use crate::oplog::OpLog;

const HANDLER_DEADLINE_SECS: u64 = 60;

/// Cloud-facing response payload of every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespMsg {
    pub status: RespCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RespMsg {
    pub fn ok() -> Self {
        RespMsg {
            status: RespCode::Success,
            message: "OK".to_string(),
            data: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        RespMsg {
            status: RespCode::Success,
            message: "OK".to_string(),
            data: Some(data),
        }
    }

    pub fn err(status: RespCode, message: impl Into<String>) -> Self {
        RespMsg {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RespCode::Success
    }
}

pub type Handler = Arc<dyn Fn(&Message) -> RespMsg + Send + Sync>;

pub struct Dispatcher {
    handlers: HashMap<(String, String), Handler>,
    oplog: Arc<OpLog>,
    permits: Arc<Semaphore>,
    deadline: Duration,
}

impl Dispatcher {
    pub fn new(oplog: Arc<OpLog>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            * 2;
        Dispatcher {
            handlers: HashMap::new(),
            oplog,
            permits: Arc::new(Semaphore::new(workers)),
            deadline: Duration::from_secs(HANDLER_DEADLINE_SECS),
        }
    }

    pub fn register(&mut self, operation: &str, resource: &str, handler: Handler) {
        self.handlers
            .insert((operation.to_string(), resource.to_string()), handler);
    }

    /// Collapse parameterized resources to their registry key.
    fn resource_key(resource: &str) -> String {
        if let Some(rest) = resource.strip_prefix("/system/ca/") {
            if !rest.is_empty() {
                return "/system/ca/<name>".to_string();
            }
        }
        if let Some(rest) = resource.strip_prefix("/pod/") {
            if !rest.is_empty() {
                return "/pod/<id>".to_string();
            }
        }
        resource.to_string()
    }

    /// Route one inbound message. Requests produce a reply message;
    /// responses only feed the operation log.
    pub async fn dispatch(&self, mut msg: Message) -> Option<Message> {
        msg_in_process(&mut msg);
        self.oplog.observe(&msg);
        if msg.is_response() {
            return None;
        }

        let key = (
            msg.operation().to_string(),
            Self::resource_key(&msg.route.resource),
        );
        let resp = match self.handlers.get(&key) {
            Some(handler) => self.run_handler(handler.clone(), &msg).await,
            None => {
                tracing::warn!(
                    operation = %key.0,
                    resource = %msg.route.resource,
                    "no handler registered"
                );
                RespMsg::err(RespCode::ParamInvalid, "unsupported operation")
            }
        };

        let content = match serde_json::to_value(&resp) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "response payload did not serialize");
                Value::Null
            }
        };
        let mut reply = if resp.is_success() {
            msg.response_to(content)
        } else {
            msg.error_to(content)
        };
        msg_out_process(&mut reply);
        self.oplog.observe_local_result(&msg, resp.is_success());
        Some(reply)
    }

    async fn run_handler(&self, handler: Handler, msg: &Message) -> RespMsg {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return RespMsg::err(RespCode::Internal, "dispatcher shut down"),
        };
        let msg = msg.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler(&msg)
        });
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "handler task failed");
                RespMsg::err(RespCode::Internal, "handler failed")
            }
            Err(_) => RespMsg::err(RespCode::Timeout, "handler deadline exceeded"),
        }
    }
}
