//! Multipart upload operations, reached through the object routes by query
//! string (`?uploads`, `?uploadId`, `?partNumber`).

use crate::{
    errors::AppError,
    handlers::object_handlers::{COPY_SOURCE_HEADER, body_stream, quoted_etag, write_context},
    models::multipart::{CompletedPart, UploadTarget},
    services::{AppContext, storage_service::RangeSpec},
};
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const COPY_SOURCE_RANGE_HEADER: &str = "x-amz-copy-source-range";
const CONTENT_MD5_HEADER: &str = "content-md5";

/// Body of a completion request.
#[derive(Debug, Deserialize)]
pub struct CompleteUploadReq {
    pub parts: Vec<CompletedPart>,
}

/// Split an `x-amz-copy-source` value (`[/]bucket/key[?versionId=..]`,
/// percent-encoded) into bucket and key.
fn parse_copy_source(raw: &str) -> Result<(String, String), AppError> {
    let path = raw.split('?').next().unwrap_or(raw);
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| AppError::invalid_argument("copy source is not valid UTF-8"))?;
    let trimmed = decoded.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(AppError::invalid_argument(
            "copy source must have the form bucket/key",
        )),
    }
}

fn parse_part_number(raw: Option<&str>) -> Result<u32, AppError> {
    raw.and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| AppError::invalid_argument("partNumber must be a positive integer"))
}

/// `POST ?uploads`
pub async fn initiate_upload(
    ctx: &AppContext,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let upload = ctx
        .multipart
        .initiate(bucket, key, &write_context(headers))
        .await?;
    Ok(Json(json!({
        "bucket": upload.bucket,
        "key": upload.key,
        "uploadId": upload.upload_id,
    }))
    .into_response())
}

/// `PUT ?partNumber&uploadId`, copying from `x-amz-copy-source` when set.
pub async fn upload_part(
    ctx: &AppContext,
    target: UploadTarget<'_>,
    part_number: Option<&str>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let part_number = parse_part_number(part_number)?;

    let copy_source = headers
        .get(COPY_SOURCE_HEADER)
        .and_then(|v| v.to_str().ok());
    let part = match copy_source {
        Some(raw) => {
            let (source_bucket, source_key) = parse_copy_source(raw)?;
            let range = match headers.get(COPY_SOURCE_RANGE_HEADER) {
                Some(value) => Some(
                    value
                        .to_str()
                        .ok()
                        .and_then(RangeSpec::parse)
                        .ok_or_else(|| AppError::invalid_argument("malformed copy source range"))?,
                ),
                None => None,
            };
            debug!(upload_id = %target.upload_id, part_number, source_bucket = %source_bucket, source_key = %source_key, "upload part copy");
            ctx.multipart
                .copy_part(target, part_number, &source_bucket, &source_key, range)
                .await?
        }
        None => {
            let content_md5 = headers
                .get(CONTENT_MD5_HEADER)
                .and_then(|v| v.to_str().ok());
            let size_hint = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            ctx.multipart
                .put_part(target, part_number, body_stream(body), content_md5, size_hint)
                .await?
        }
    };

    let mut response = Json(json!({
        "partNumber": part.part_number,
        "etag": format!("\"{}\"", part.etag),
        "lastModified": part.last_modified,
    }))
    .into_response();
    if let Some(value) = quoted_etag(&part.etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `POST ?uploadId` with a JSON part list.
pub async fn complete_upload(
    ctx: &AppContext,
    target: UploadTarget<'_>,
    body: &[u8],
) -> Result<Response, AppError> {
    let req: CompleteUploadReq = serde_json::from_slice(body)
        .map_err(|err| AppError::invalid_argument(format!("malformed part list: {err}")))?;
    let record = ctx.multipart.complete(target, &req.parts).await?;

    let mut response = Json(json!({
        "bucket": record.bucket,
        "key": record.key,
        "etag": format!("\"{}\"", record.etag),
        "size": record.size_bytes,
        "versionId": record.version_id,
    }))
    .into_response();
    if let Some(value) = quoted_etag(&record.etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `DELETE ?uploadId`. Unknown uploads are not an error.
pub async fn abort_upload(ctx: &AppContext, target: UploadTarget<'_>) -> Result<Response, AppError> {
    ctx.multipart.abort(target).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET ?uploadId`
pub async fn list_parts(ctx: &AppContext, target: UploadTarget<'_>) -> Result<Response, AppError> {
    let (upload, parts) = ctx.multipart.list_parts(target).await?;
    let parts: Vec<_> = parts
        .iter()
        .map(|p| {
            json!({
                "partNumber": p.part_number,
                "etag": format!("\"{}\"", p.etag),
                "size": p.size_bytes,
                "lastModified": p.last_modified,
            })
        })
        .collect();
    Ok(Json(json!({
        "bucket": upload.bucket,
        "key": upload.key,
        "uploadId": upload.upload_id,
        "location": upload.location,
        "state": upload.state,
        "parts": parts,
    }))
    .into_response())
}
