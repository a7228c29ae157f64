//! Webhook trigger endpoint, POST /webhook.
//!
//! Runs the due jobs, or force-runs one job when a job id is given via
//! `?job=` or a JSON body `{"job": "..."}`. Callers authenticate with the
//! configured token (`Authorization: Bearer` or `?token=`), or with an
//! `X-Signature-256: sha256=<hex>` HMAC over the raw body when
//! `hmac_secret` is set.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use cronkeep_scheduler::{WebhookResult, WebhookStatus};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-signature-256";

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
    pub job: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    job: Option<String>,
}

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /webhook
///
/// 404 when webhooks are disabled or the job is unknown, 401 on a bad token
/// or signature, 500 when the run itself errors, 200 otherwise.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResult>) {
    let cfg = &state.config.scheduler.modern.webhook;
    let job_id = query.job.clone().or_else(|| job_from_body(&body));

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let mut scheduler = state.scheduler.lock().await;
    let result = match (signature, cfg.hmac_secret.as_deref()) {
        (Some(sig), Some(secret)) if cfg.enabled => match verify_signature(sig, &body, secret) {
            Ok(()) => scheduler.trigger(job_id.as_deref()).await,
            Err(reason) => {
                warn!(reason = %reason, "webhook signature rejected");
                WebhookResult::rejected(WebhookStatus::Unauthorized, "Invalid webhook signature")
            }
        },
        _ => {
            let token = bearer_token(&headers).or(query.token.as_deref());
            scheduler
                .process_webhook_trigger(token, job_id.as_deref())
                .await
        }
    };

    info!(
        job_id = job_id.as_deref().unwrap_or("-"),
        success = result.success,
        "webhook handled"
    );
    (status_code(result.status), Json(result))
}

fn status_code(status: WebhookStatus) -> StatusCode {
    match status {
        WebhookStatus::Executed => StatusCode::OK,
        WebhookStatus::Disabled | WebhookStatus::NotFound => StatusCode::NOT_FOUND,
        WebhookStatus::Unauthorized => StatusCode::UNAUTHORIZED,
        WebhookStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Job id from a JSON body. Empty or non-JSON bodies carry none.
fn job_from_body(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice::<WebhookBody>(body)
        .ok()
        .and_then(|b| b.job)
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Verify `sha256=<hex>` against an HMAC-SHA256 of the raw body.
fn verify_signature(header: &str, body: &Bytes, secret: &str) -> Result<(), String> {
    let sig_hex = header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}
