//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks SQLite and every configured location

use crate::services::AppContext;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// `GET /healthz`
///
/// Very small liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against SQLite and the healthcheck of every registered
/// location, concurrently. HTTP 200 when all pass, 503 otherwise.
pub async fn readyz(State(ctx): State<AppContext>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*ctx.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let probes = ctx.registry.locations().map(|(name, client)| {
        let name = name.to_string();
        let client = client.clone();
        async move {
            let status = match client.healthcheck().await {
                Ok(health) if health.ok => CheckStatus::ok(),
                Ok(health) => CheckStatus::failed(
                    health.detail.unwrap_or_else(|| "unhealthy".to_string()),
                ),
                Err(e) => CheckStatus::failed(e.to_string()),
            };
            (format!("location:{name}"), status)
        }
    });
    let mut checks: BTreeMap<String, CheckStatus> = join_all(probes).await.into_iter().collect();
    checks.insert("sqlite".to_string(), sqlite);

    let overall_ok = checks.values().all(|c| c.ok);
    for (name, check) in checks.iter().filter(|(_, c)| !c.ok) {
        warn!(check = %name, error = ?check.error, "readiness check failed");
    }

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        routes::routes::routes,
        test_support::{Fixture, app_context},
    };
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn readyz_reports_every_location() {
        let fixture = Fixture::new();
        let app = routes().with_state(app_context(&fixture).await);

        let resp = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["location:mem"]["ok"], true);
        assert_eq!(body["checks"]["location:file"]["ok"], true);
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let resp = healthz().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
