//! Built-in operation handlers and their registration.
//!
//! Every handler converts its subsystem error into a `RespMsg` with a
//! stable status code; nothing here returns `Result` to the
//! dispatcher. Payload field names follow the cloud contract
//! (camelCase).

use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use mefedge_certmgr::{CertEngine, CertmgrError};
use mefedge_certstore::CertName;
use mefedge_common::error::RespCode;
use mefedge_common::exec;
use mefedge_common::paths::PathLayout;
use mefedge_common::registry::{ConfigRegistry, NetType};
use mefedge_common::validate::{Checker, FILE_NAME_RE};
use mefedge_lifecycle::modelfiles::ModelFileManager;
use mefedge_lifecycle::netconfig::{NetConfigManager, NetConfigUpdate};
use mefedge_lifecycle::LifecycleError;

use crate::dispatch::{Dispatcher, RespMsg};
use crate::message::{Message, OP_DELETE, OP_GET, OP_QUERY, OP_RESTART, OP_UPDATE};

type PodRestarter = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Shared state handed to every handler closure.
pub struct HandlerCtx {
    pub engine: Arc<CertEngine>,
    pub registry: Arc<ConfigRegistry>,
    pub net_config: Arc<NetConfigManager>,
    pub models: Arc<ModelFileManager>,
    pub layout: PathLayout,
    pod_restarter: PodRestarter,
}

impl HandlerCtx {
    pub fn new(
        engine: Arc<CertEngine>,
        registry: Arc<ConfigRegistry>,
        net_config: Arc<NetConfigManager>,
        models: Arc<ModelFileManager>,
        layout: PathLayout,
    ) -> Self {
        HandlerCtx {
            engine,
            registry,
            net_config,
            models,
            layout,
            pod_restarter: Box::new(|id| {
                exec::run("docker", &["restart", id])
                    .map_err(|e| e.to_string())
                    .and_then(|out| {
                        if out.status_ok {
                            Ok(())
                        } else {
                            Err(out.stderr)
                        }
                    })
            }),
        }
    }

    /// Swap out the container runtime call; tests use this.
    pub fn with_pod_restarter(mut self, restarter: PodRestarter) -> Self {
        self.pod_restarter = restarter;
        self
    }
}

/// Register the full handler table on a dispatcher.
pub fn register_all(dispatcher: &mut Dispatcher, ctx: Arc<HandlerCtx>) {
    let c = ctx.clone();
    dispatcher.register(
        OP_GET,
        "/system/ca/<name>",
        Arc::new(move |msg| query_ca(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_UPDATE,
        "/system/ca",
        Arc::new(move |msg| import_root_ca(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_DELETE,
        "/system/ca",
        Arc::new(move |msg| delete_root_ca(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_UPDATE,
        "/system/csr",
        Arc::new(move |msg| issue_service_cert(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_UPDATE,
        "/system/crl",
        Arc::new(move |msg| import_crl(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_UPDATE,
        "/system/model-file",
        Arc::new(move |msg| model_file_op(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_UPDATE,
        "/system/prepare-dir",
        Arc::new(move |msg| prepare_dir(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(
        OP_RESTART,
        "/pod/<id>",
        Arc::new(move |msg| restart_pod(&c, msg)),
    );
    let c = ctx.clone();
    dispatcher.register(OP_UPDATE, "/pod", Arc::new(move |msg| update_pod(&c, msg)));
    let c = ctx.clone();
    dispatcher.register(
        OP_QUERY,
        "/net-config",
        Arc::new(move |msg| get_net_config(&c, msg)),
    );
    let c = ctx;
    dispatcher.register(
        OP_UPDATE,
        "/net-config",
        Arc::new(move |msg| set_net_config(&c, msg)),
    );
}

fn certmgr_err(err: CertmgrError) -> RespMsg {
    tracing::warn!(error = %err, "certificate operation failed");
    RespMsg::err(err.code(), err.to_string())
}

fn lifecycle_err(err: LifecycleError) -> RespMsg {
    tracing::warn!(error = %err, "lifecycle operation failed");
    let code = match err {
        LifecycleError::Param(_) => RespCode::ParamInvalid,
        _ => RespCode::Internal,
    };
    RespMsg::err(code, err.to_string())
}

fn parse_payload<T: serde::de::DeserializeOwned>(msg: &Message) -> Result<T, RespMsg> {
    msg.content_as::<T>()
        .map_err(|e| RespMsg::err(RespCode::ParamConvert, format!("payload: {e}")))
}

fn cert_name(raw: &str) -> Result<CertName, RespMsg> {
    CertName::from_str(raw)
        .map_err(|_| RespMsg::err(RespCode::ParamInvalid, format!("unknown cert name: {raw}")))
}

// ── certificates ──

fn query_ca(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let raw = match msg.route.resource.rsplit('/').next() {
        Some(seg) if !seg.is_empty() => seg,
        _ => return RespMsg::err(RespCode::ParamInvalid, "missing cert name"),
    };
    let name = match cert_name(raw) {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    match ctx.engine.query_ca(name) {
        Ok(pem) => RespMsg::ok_with(json!({"caName": raw, "caContent": B64.encode(pem)})),
        Err(err) => certmgr_err(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaImportPayload {
    ca_name: String,
    ca_content: String,
}

fn import_root_ca(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: CaImportPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let name = match cert_name(&payload.ca_name) {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    match ctx.engine.import_root_ca(name, &payload.ca_content) {
        Ok(info) => RespMsg::ok_with(json!({
            "subject": info.subject,
            "serialNumber": info.serial_number,
            "notAfter": info.not_after.to_rfc3339(),
        })),
        Err(err) => certmgr_err(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaDeletePayload {
    ca_name: String,
}

fn delete_root_ca(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: CaDeletePayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let name = match cert_name(&payload.ca_name) {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    match ctx.engine.delete_root_ca(name) {
        Ok(()) => RespMsg::ok(),
        Err(err) => certmgr_err(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrPayload {
    cert_name: String,
    csr_content: String,
}

fn issue_service_cert(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: CsrPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let name = match cert_name(&payload.cert_name) {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    if let Err(err) = ctx.engine.ensure_issuing_ca(name) {
        return certmgr_err(err);
    }
    match ctx.engine.issue_service_cert(name, &payload.csr_content) {
        Ok(issued) => RespMsg::ok_with(json!({
            "cert": issued.cert_pem,
            "caCert": issued.ca_pem,
            "fingerprint": issued.fingerprint,
            "notAfter": issued.expires.to_rfc3339(),
        })),
        Err(err) => certmgr_err(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrlPayload {
    crl_name: String,
    crl_content: String,
}

fn import_crl(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: CrlPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let name = match cert_name(&payload.crl_name) {
        Ok(n) => n,
        Err(resp) => return resp,
    };
    match ctx.engine.import_crl(name, &payload.crl_content) {
        Ok(info) => RespMsg::ok_with(json!({
            "issuer": info.issuer,
            "revokedCount": info.revoked_serials.len(),
        })),
        Err(err) => certmgr_err(err),
    }
}

// ── model files ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPayload {
    operation: String,
    uuid: String,
    #[serde(default)]
    name: String,
}

fn model_file_op(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: ModelPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let result = match payload.operation.as_str() {
        "activate" => ctx.models.activate(&payload.uuid, &payload.name).map(Some),
        "deactivate" => ctx
            .models
            .deactivate(&payload.uuid, &payload.name)
            .map(Some),
        "delete" => ctx.models.delete(&payload.uuid).map(|_| None),
        other => {
            return RespMsg::err(
                RespCode::ParamInvalid,
                format!("unknown model operation: {other}"),
            )
        }
    };
    match result {
        Ok(Some(entry)) => match serde_json::to_value(&entry) {
            Ok(data) => RespMsg::ok_with(data),
            Err(e) => RespMsg::err(RespCode::Internal, e.to_string()),
        },
        Ok(None) => RespMsg::ok(),
        Err(err) => lifecycle_err(err),
    }
}

// ── directories ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareDirPayload {
    path: String,
}

fn prepare_dir(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: PrepareDirPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    // Relative path under the model download tree only; no traversal.
    let clean = payload.path.trim_matches('/');
    if clean.is_empty()
        || clean
            .split('/')
            .any(|seg| Checker::new("path", seg).matches(&FILE_NAME_RE).finish().is_err())
    {
        return RespMsg::err(
            RespCode::ParamInvalid,
            format!("invalid directory path: {}", payload.path),
        );
    }
    let target = ctx.layout.model_download_dir().join(clean);
    match std::fs::create_dir_all(&target) {
        Ok(()) => RespMsg::ok_with(json!({"path": target.display().to_string()})),
        Err(e) => {
            tracing::warn!(error = %e, path = %target.display(), "prepare-dir failed");
            RespMsg::err(RespCode::Internal, "directory creation failed")
        }
    }
}

// ── pods ──

fn restart_pod(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let id = match msg.route.resource.rsplit('/').next() {
        Some(seg) if !seg.is_empty() => seg,
        _ => return RespMsg::err(RespCode::ParamInvalid, "missing pod id"),
    };
    if Checker::new("podId", id)
        .required()
        .max_len(128)
        .matches(&FILE_NAME_RE)
        .finish()
        .is_err()
    {
        return RespMsg::err(RespCode::ParamInvalid, format!("invalid pod id: {id}"));
    }
    match (ctx.pod_restarter)(id) {
        Ok(()) => RespMsg::ok(),
        Err(reason) => {
            tracing::warn!(pod = id, reason = %reason, "pod restart failed");
            RespMsg::err(RespCode::Internal, "pod restart failed")
        }
    }
}

fn update_pod(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    if msg.content.is_null() {
        return RespMsg::err(RespCode::ParamInvalid, "empty pod payload");
    }
    match ctx.registry.write_json("edge_main", "pods.json", &msg.content) {
        Ok(()) => RespMsg::ok(),
        Err(e) => {
            tracing::warn!(error = %e, "pod state persist failed");
            RespMsg::err(RespCode::Internal, "pod state persist failed")
        }
    }
}

// ── net config ──

fn get_net_config(ctx: &HandlerCtx, _msg: &Message) -> RespMsg {
    match ctx.net_config.get() {
        Ok(cfg) => RespMsg::ok_with(json!({
            "netType": cfg.net_type,
            "ip": cfg.ip,
            "port": cfg.port,
            "withOm": cfg.with_om,
        })),
        Err(err) => lifecycle_err(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetConfigPayload {
    #[serde(default)]
    net_type: Option<NetType>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    with_om: Option<bool>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    cloud_ca: Option<String>,
}

fn set_net_config(ctx: &HandlerCtx, msg: &Message) -> RespMsg {
    let payload: NetConfigPayload = match parse_payload(msg) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let update = NetConfigUpdate {
        net_type: payload.net_type,
        ip: payload.ip,
        port: payload.port,
        with_om: payload.with_om,
        token: payload.token,
        cloud_ca_b64: payload.cloud_ca,
    };
    match ctx.net_config.set(update) {
        Ok(cfg) => RespMsg::ok_with(json!({
            "netType": cfg.net_type,
            "ip": cfg.ip,
            "port": cfg.port,
            "withOm": cfg.with_om,
        })),
        Err(err) => lifecycle_err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::oplog::OpLog;
    use mefedge_certstore::CertFileStore;
    use mefedge_keystore::KeyStore;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
    use serde_json::json;
    use tempfile::tempdir;

    fn ca_pem(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.self_signed(&key).unwrap().pem()
    }

    fn csr_pem(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    fn ctx() -> (tempfile::TempDir, Arc<HandlerCtx>) {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path());
        let keys = Arc::new(
            KeyStore::init(&dir.path().join("primary.ks"), &dir.path().join("standby.ks"))
                .unwrap(),
        );
        let files = CertFileStore::new(dir.path().join("certs"));
        let engine = Arc::new(CertEngine::new(files, keys.clone(), 2));
        let registry = Arc::new(ConfigRegistry::open_in_memory(&layout.config_root()).unwrap());
        registry.create_tables().unwrap();
        let net_config = Arc::new(NetConfigManager::new(
            registry.clone(),
            engine.clone(),
            keys,
            2,
        ));
        let models = Arc::new(ModelFileManager::new(&layout));
        let ctx = HandlerCtx::new(engine, registry, net_config, models, layout)
            .with_pod_restarter(Box::new(|_| Ok(())));
        (dir, Arc::new(ctx))
    }

    fn request(operation: &str, resource: &str, content: serde_json::Value) -> Message {
        Message::request("cloud", "om", operation, resource, content)
    }

    // ── certificate round trips ──

    #[test]
    fn import_then_query_returns_same_ca() {
        let (_dir, ctx) = ctx();
        let pem = ca_pem("MEF Image Root");
        let b64 = B64.encode(pem.as_bytes());

        let resp = import_root_ca(
            &ctx,
            &request(OP_UPDATE, "/system/ca", json!({"caName": "image", "caContent": b64})),
        );
        assert!(resp.is_success(), "{}", resp.message);

        let resp = query_ca(&ctx, &request(OP_GET, "/system/ca/image", json!({})));
        assert!(resp.is_success());
        let data = resp.data.unwrap();
        let stored = B64.decode(data["caContent"].as_str().unwrap()).unwrap();
        assert_eq!(stored, pem.as_bytes());
    }

    #[test]
    fn issue_service_cert_chains_to_local_ca() {
        let (_dir, ctx) = ctx();
        let resp = issue_service_cert(
            &ctx,
            &request(
                OP_UPDATE,
                "/system/csr",
                json!({"certName": "inner", "csrContent": csr_pem("edge-svc")}),
            ),
        );
        assert!(resp.is_success(), "{}", resp.message);
        let data = resp.data.unwrap();
        assert!(data["cert"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!data["caCert"].as_str().unwrap().is_empty());
    }

    #[test]
    fn oversized_crl_is_rejected_without_a_file() {
        let (_dir, ctx) = ctx();
        let blob = B64.encode(vec![0u8; 21 * 1024 * 1024]);
        let resp = import_crl(
            &ctx,
            &request(OP_UPDATE, "/system/crl", json!({"crlName": "northern", "crlContent": blob})),
        );
        assert!(!resp.is_success());
        assert!(ctx
            .engine
            .query_crl(CertName::Northern)
            .is_err());
    }

    #[test]
    fn unknown_cert_name_is_param_invalid() {
        let (_dir, ctx) = ctx();
        let resp = query_ca(&ctx, &request(OP_GET, "/system/ca/bogus", json!({})));
        assert_eq!(resp.status, RespCode::ParamInvalid);
    }

    // ── pods ──

    #[test]
    fn restart_pod_validates_id() {
        let (_dir, ctx) = ctx();
        let ok = restart_pod(&ctx, &request(OP_RESTART, "/pod/7c5a", json!({})));
        assert!(ok.is_success());

        let bad = restart_pod(&ctx, &request(OP_RESTART, "/pod/..", json!({})));
        assert_eq!(bad.status, RespCode::ParamInvalid);
    }

    #[test]
    fn update_pod_persists_state() {
        let (_dir, ctx) = ctx();
        let resp = update_pod(&ctx, &request(OP_UPDATE, "/pod", json!([{"id": "p1"}])));
        assert!(resp.is_success());
        let stored: serde_json::Value = ctx.registry.read_json("edge_main", "pods.json").unwrap();
        assert_eq!(stored[0]["id"], "p1");
    }

    // ── net config ──

    #[test]
    fn net_config_round_trip_hides_token() {
        let (_dir, ctx) = ctx();
        let resp = set_net_config(
            &ctx,
            &request(
                OP_UPDATE,
                "/net-config",
                json!({"netType": "FD", "ip": "10.0.0.5", "port": 8443, "token": "secret"}),
            ),
        );
        assert!(resp.is_success(), "{}", resp.message);

        let resp = get_net_config(&ctx, &request(OP_QUERY, "/net-config", json!({})));
        let data = resp.data.unwrap();
        assert_eq!(data["ip"], "10.0.0.5");
        assert!(data.get("token").is_none());
        assert!(data.get("tokenCipher").is_none());
    }

    // ── model files / dirs ──

    #[test]
    fn prepare_dir_rejects_traversal() {
        let (_dir, ctx) = ctx();
        let resp = prepare_dir(
            &ctx,
            &request(OP_UPDATE, "/system/prepare-dir", json!({"path": "../escape"})),
        );
        assert_eq!(resp.status, RespCode::ParamInvalid);

        let resp = prepare_dir(
            &ctx,
            &request(OP_UPDATE, "/system/prepare-dir", json!({"path": "models/resnet"})),
        );
        assert!(resp.is_success());
    }

    #[test]
    fn model_file_unknown_operation_is_rejected() {
        let (_dir, ctx) = ctx();
        let resp = model_file_op(
            &ctx,
            &request(
                OP_UPDATE,
                "/system/model-file",
                json!({"operation": "explode", "uuid": "3e9c7f1a-2b4d-4e5f-8a9b-0c1d2e3f4a5b"}),
            ),
        );
        assert_eq!(resp.status, RespCode::ParamInvalid);
    }

    // ── full dispatch wiring ──

    #[tokio::test]
    async fn registered_table_serves_end_to_end() {
        let (_dir, ctx) = ctx();
        let mut dispatcher = Dispatcher::new(Arc::new(OpLog::new()));
        register_all(&mut dispatcher, ctx);

        let pem = ca_pem("MEF Northern Root");
        let req = request(
            OP_UPDATE,
            "/system/ca",
            json!({"caName": "northern", "caContent": B64.encode(pem.as_bytes())}),
        );
        let reply = dispatcher.dispatch(req.clone()).await.unwrap();
        assert_eq!(reply.header.parent_id, req.header.id);
        let resp: RespMsg = reply.content_as().unwrap();
        assert!(resp.is_success(), "{}", resp.message);
    }
}
