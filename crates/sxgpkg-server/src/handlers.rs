//! HTTP route handlers.

use axum::extract::{Path, RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, VARY, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sxgpkg_signer::HealthError;
use tracing::{debug, warn};

use sxgpkg_core::SXG_CONTENT_TYPE;
use sxgpkg_signer::CERT_CHAIN_CONTENT_TYPE;

use crate::error::{PackageError, Result};
use crate::packager::{PackageOutcome, PackageRequest};
use crate::state::AppState;

/// Empty CBOR map.
const VALIDITY_DATA: &[u8] = &[0xa0];

fn request_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn outcome_response(outcome: PackageOutcome) -> Response {
    match outcome {
        PackageOutcome::Signed {
            exchange,
            amp_cache_transform,
        } => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(SXG_CONTENT_TYPE));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-transform"));
            headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
            headers.insert(VARY, HeaderValue::from_static("Accept, AMP-Cache-Transform"));
            if let Some(value) = amp_cache_transform.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(HeaderName::from_static("amp-cache-transform"), value);
            }
            (StatusCode::OK, headers, exchange).into_response()
        }
        PackageOutcome::Proxied(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for (name, value) in &response.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.append(name, value);
                }
            }
            (status, headers, response.body).into_response()
        }
    }
}

/// GET /priv/doc?sign=...&fetch=... - Package a document.
pub async fn package_query(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let request = PackageRequest::from_query(query.as_deref().unwrap_or(""), request_headers(&headers));
    let outcome = state.packager.package(request).await?;
    Ok(outcome_response(outcome))
}

/// GET /priv/doc/{*sign} - Package the document named in the path.
pub async fn package_path(
    State(state): State<AppState>,
    Path(sign): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let request = PackageRequest::from_path(&sign, query.as_deref(), request_headers(&headers));
    let outcome = state.packager.package(request).await?;
    Ok(outcome_response(outcome))
}

/// GET /amppkg/cert/{name} - Serve a certificate chain.
pub async fn cert_chain(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let current = state.certs.current();
    let (chain, max_age) = if current.cert_url_name() == name {
        // Caches should come back for a fresh OCSP response at its midpoint
        let window = current.ocsp_window().map_err(HealthError::from)?;
        let chain = state
            .chains
            .get_or_insert(&current)
            .map_err(|source| PackageError::Signing {
                url: name.clone(),
                source,
            })?;
        let max_age = (window.midpoint() - Utc::now()).num_seconds().max(0);
        (Some(chain), max_age)
    } else {
        (state.chains.get(&name), 0)
    };

    let Some(chain) = chain else {
        debug!("Unknown certificate {}", name);
        return Err(PackageError::ArtifactNotFound(format!("certificate {}", name)));
    };

    Ok((
        [
            (CONTENT_TYPE, CERT_CHAIN_CONTENT_TYPE.to_string()),
            (CACHE_CONTROL, format!("public, max-age={}", max_age)),
            (X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
        ],
        chain.as_ref().clone(),
    )
        .into_response())
}

/// Body of `GET /healthz`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub certificate: String,
    pub not_after: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocsp_next_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /healthz - Whether the packager would sign right now.
pub async fn healthz(State(state): State<AppState>) -> Response {
    let current = state.certs.current();
    let health = current.health(Utc::now());
    if let Err(e) = &health {
        warn!("Health check failed: {}", e);
    }
    let status = if health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = HealthResponse {
        healthy: health.is_ok(),
        certificate: current.cert_url_name().to_string(),
        not_after: current.not_after(),
        ocsp_next_update: current.ocsp_window().ok().map(|w| w.next_update),
        error: health.err().map(|e| e.to_string()),
    };
    (status, [(CACHE_CONTROL, "no-store")], Json(body)).into_response()
}

/// GET /amppkg/validity - Serve validity data.
pub async fn validity() -> Response {
    (
        [
            (CONTENT_TYPE, "application/cbor"),
            (CACHE_CONTROL, "public, max-age=604800"),
        ],
        VALIDITY_DATA,
    )
        .into_response()
}
