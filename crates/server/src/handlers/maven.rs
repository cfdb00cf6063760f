//! Maven repository endpoints.
//!
//! Every path outside the reserved `/-/` prefix is a repository path, so
//! this is mounted as the router fallback.

use crate::auth;
use crate::engine::{ArtifactBody, ArtifactMeta, PublishOutcome};
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use time::UtcOffset;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// Header naming where the served bytes came from.
pub const ORIGIN_HEADER: &str = "x-quarry-origin";

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Fallback handler dispatching on method.
pub async fn repository_fallback(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let response = match handle(&state, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    metrics::record_request(method.as_str(), response.status());
    response
}

async fn handle(state: &AppState, req: Request) -> ApiResult<Response> {
    let path = decode_path(req.uri().path())?;
    let method = req.method().clone();
    if method == Method::GET {
        get_artifact(state, &path, req.headers()).await
    } else if method == Method::HEAD {
        head_artifact(state, &path).await
    } else if method == Method::PUT {
        put_artifact(state, &path, req).await
    } else {
        Err(ApiError::NotImplemented(method.to_string()))
    }
}

fn decode_path(raw: &str) -> ApiResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|p| p.into_owned())
        .map_err(|_| ApiError::InvalidPath("path is not valid UTF-8".to_string()))
}

/// GET /{path} - Serve an artifact, fetching it on a miss.
async fn get_artifact(state: &AppState, path: &str, headers: &HeaderMap) -> ApiResult<Response> {
    let (meta, body) = state.engine.resolve(path).await?;

    if etag_matches(headers, &meta.etag) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        response
            .headers_mut()
            .insert(ETAG, quoted_etag(&meta.etag)?);
        return Ok(response);
    }

    metrics::BYTES_SERVED.inc_by(meta.content_length);
    let body = match body {
        ArtifactBody::Stream(stream) => Body::from_stream(stream),
        ArtifactBody::Bytes(bytes) => Body::from(bytes),
    };
    let mut response = (StatusCode::OK, body).into_response();
    apply_headers(response.headers_mut(), &meta)?;
    Ok(response)
}

/// HEAD /{path} - Artifact metadata without the body.
async fn head_artifact(state: &AppState, path: &str) -> ApiResult<Response> {
    let meta = state.engine.head(path).await?;
    let mut response = StatusCode::OK.into_response();
    apply_headers(response.headers_mut(), &meta)?;
    Ok(response)
}

/// PUT /{path} - Publish an artifact. Requires publisher credentials.
async fn put_artifact(state: &AppState, path: &str, req: Request) -> ApiResult<Response> {
    let limit = state.config.server.max_upload_size;
    let length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(ApiError::LengthRequired)?;
    if length > limit {
        return Err(ApiError::PayloadTooLarge {
            size: length,
            limit,
        });
    }

    let user = auth::require_publisher(state.engine.state().users(), req.headers()).await?;

    let data = axum::body::to_bytes(req.into_body(), length as usize)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;

    match state.engine.publish(path, data).await? {
        PublishOutcome::Stored(entry) => {
            tracing::info!(path = %entry.path, user = %user.name, "Upload accepted");
            let mut response = StatusCode::CREATED.into_response();
            response
                .headers_mut()
                .insert(ETAG, quoted_etag(&entry.checksums.sha256)?);
            Ok(response)
        }
        PublishOutcome::IgnoredSidecar => Ok(StatusCode::ACCEPTED.into_response()),
    }
}

fn apply_headers(headers: &mut HeaderMap, meta: &ArtifactMeta) -> ApiResult<()> {
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type(meta.path.extension().as_deref())),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(meta.content_length));
    headers.insert(ETAG, quoted_etag(&meta.etag)?);
    if let Some(date) = http_date(meta.last_modified) {
        headers.insert(LAST_MODIFIED, date);
    }
    if let Ok(origin) = HeaderValue::from_str(&meta.origin.to_string()) {
        headers.insert(ORIGIN_HEADER, origin);
    }
    Ok(())
}

fn quoted_etag(etag: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&format!("\"{etag}\""))
        .map_err(|e| ApiError::Internal(format!("invalid etag: {e}")))
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    value.split(',').map(str::trim).any(|candidate| {
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate == "*" || candidate.trim_matches('"') == etag
    })
}

fn http_date(when: time::OffsetDateTime) -> Option<HeaderValue> {
    let formatted = when.to_offset(UtcOffset::UTC).format(HTTP_DATE).ok()?;
    HeaderValue::from_str(&formatted).ok()
}

/// Content type by file extension.
pub fn content_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("jar" | "war" | "ear" | "aar") => "application/java-archive",
        Some("pom" | "xml") => "application/xml",
        Some("module" | "json") => "application/json",
        Some("zip") => "application/zip",
        Some("asc") => "application/pgp-signature",
        Some("sha1" | "sha256" | "sha512" | "md5" | "sig" | "txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
