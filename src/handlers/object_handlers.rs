//! HTTP handlers for bucket and object operations.
//! Bodies are streamed straight into the resolved backend; placement and
//! multipart concerns live in the services.

use crate::{
    backends::ByteStream,
    errors::AppError,
    handlers::multipart_handlers,
    models::{multipart::UploadTarget, object::ObjectRecord},
    services::{
        AppContext,
        storage_service::{RangeSpec, WriteContext},
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

/// Object-level location hint.
pub const LOCATION_HINT_HEADER: &str = "x-amz-meta-scal-location-constraint";
const USER_META_PREFIX: &str = "x-amz-meta-";
const VERSION_ID_HEADER: &str = "x-amz-version-id";
const CONTENT_MD5_HEADER: &str = "content-md5";
pub(crate) const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";

/// Query parameters that select the operation on an object route.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    pub uploads: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<String>,
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
}

/// Request body for `PUT /{bucket}` (create bucket).
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
    /// `"Enabled"` turns on versioning.
    #[serde(rename = "Versioning")]
    pub versioning: Option<String>,
}

/// Host the request was addressed to, without its port.
pub(crate) fn request_endpoint(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or(v6),
        None => host.rsplit_once(':').map_or(host, |(name, _)| name),
    };
    host.to_ascii_lowercase()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Placement hints, metadata and integrity headers of a write.
pub(crate) fn write_context(headers: &HeaderMap) -> WriteContext {
    let user_metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(USER_META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    WriteContext {
        location_hint: header_str(headers, LOCATION_HINT_HEADER).map(str::to_string),
        request_endpoint: request_endpoint(headers),
        content_type: header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
        user_metadata,
        content_md5: header_str(headers, CONTENT_MD5_HEADER).map(str::to_string),
        size_hint: header_str(headers, header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok()),
    }
}

pub(crate) fn body_stream(body: Body) -> ByteStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

pub(crate) fn quoted_etag(etag: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("\"{etag}\"")).ok()
}

fn http_date(record: &ObjectRecord) -> String {
    record
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn set_object_headers(headers: &mut HeaderMap, record: &ObjectRecord, length: u64) {
    let content_type = record
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(value) = quoted_etag(&record.etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(record)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Some(value) = record
        .version_id
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(HeaderName::from_static(VERSION_ID_HEADER), value);
    }
    for (key, value) in record.user_metadata.iter() {
        let name = HeaderName::from_bytes(format!("{USER_META_PREFIX}{key}").as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

/// PUT `/{bucket}`: create bucket.
pub async fn create_bucket(
    State(ctx): State<AppContext>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let req: CreateBucketReq = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBucketReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::invalid_argument(format!("malformed bucket request: {err}")))?
    };
    let versioning = req
        .versioning
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("enabled"));

    let created = ctx
        .storage
        .create_bucket(
            &bucket,
            req.location_constraint.as_deref(),
            versioning,
            &request_endpoint(&headers),
        )
        .await?;

    Ok((
        StatusCode::OK,
        [(header::LOCATION, format!("/{}", created.name))],
        Json(json!({
            "bucket": created.name,
            "locationConstraint": created.location_constraint,
            "versioning": created.versioning_enabled,
        })),
    ))
}

/// DELETE `/{bucket}`: delete an empty bucket.
pub async fn delete_bucket(
    State(ctx): State<AppContext>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    ctx.storage.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT `/{bucket}/{*key}`: put an object, or upload / copy a part when
/// `uploadId` is present.
pub async fn put_object(
    State(ctx): State<AppContext>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if let Some(upload_id) = query.upload_id.as_deref() {
        return multipart_handlers::upload_part(
            &ctx,
            UploadTarget::new(&bucket, &key, upload_id),
            query.part_number.as_deref(),
            &headers,
            body,
        )
        .await;
    }
    if headers.contains_key(COPY_SOURCE_HEADER) {
        return Err(AppError::invalid_argument(
            "copy source is only supported for part uploads",
        ));
    }

    let record = ctx
        .storage
        .put_object(&bucket, &key, body_stream(body), write_context(&headers))
        .await?;

    let mut response = Response::new(Body::empty());
    if let Some(value) = quoted_etag(&record.etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    if let Some(value) = record
        .version_id
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        response
            .headers_mut()
            .insert(HeaderName::from_static(VERSION_ID_HEADER), value);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}`: stream an object (honouring `Range`), or list
/// the parts of an upload when `uploadId` is present.
pub async fn get_object(
    State(ctx): State<AppContext>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(upload_id) = query.upload_id.as_deref() {
        return multipart_handlers::list_parts(&ctx, UploadTarget::new(&bucket, &key, upload_id))
            .await;
    }

    // malformed ranges are ignored and the whole object is served
    let range = header_str(&headers, header::RANGE.as_str()).and_then(RangeSpec::parse);
    let (record, resolved, stream) = ctx.storage.get_object(&bucket, &key, range).await?;
    let total = record.size_bytes.max(0) as u64;

    let mut response = Response::new(Body::from_stream(stream));
    match resolved {
        Some(range) => {
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            set_object_headers(response.headers_mut(), &record, range.len());
            if let Ok(value) =
                HeaderValue::from_str(&format!("bytes {}-{}/{total}", range.start, range.end))
            {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        None => set_object_headers(response.headers_mut(), &record, total),
    }
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(ctx): State<AppContext>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let record = ctx.storage.head_object(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(
        response.headers_mut(),
        &record,
        record.size_bytes.max(0) as u64,
    );
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`: delete an object, or abort an upload when
/// `uploadId` is present.
pub async fn delete_object(
    State(ctx): State<AppContext>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    if let Some(upload_id) = query.upload_id.as_deref() {
        return multipart_handlers::abort_upload(&ctx, UploadTarget::new(&bucket, &key, upload_id))
            .await;
    }
    ctx.storage
        .delete_object(&bucket, &key, query.version_id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST `/{bucket}/{*key}`: `?uploads` initiates, `?uploadId` completes.
pub async fn post_object(
    State(ctx): State<AppContext>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    match (query.uploads.is_some(), query.upload_id.as_deref()) {
        (true, _) => multipart_handlers::initiate_upload(&ctx, &bucket, &key, &headers).await,
        (false, Some(upload_id)) => {
            let target = UploadTarget::new(&bucket, &key, upload_id);
            multipart_handlers::complete_upload(&ctx, target, &body).await
        }
        (false, None) => Err(AppError::invalid_argument(
            "POST on an object requires `uploads` or `uploadId`",
        )),
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
        Router,
        body::to_bytes,
        http::{Method, Request},
    };
    use tower::ServiceExt;

    async fn app(fixture: &Fixture) -> Router {
        routes().with_state(app_context(fixture).await)
    }

    fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "localhost:8000")
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn request_endpoint_strips_the_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("LocalHost:8000"));
        assert_eq!(request_endpoint(&headers), "localhost");
        headers.insert(header::HOST, HeaderValue::from_static("[::1]:8000"));
        assert_eq!(request_endpoint(&headers), "::1");
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1"));
        assert_eq!(request_endpoint(&headers), "127.0.0.1");
    }

    #[test]
    fn write_context_collects_hint_and_user_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION_HINT_HEADER, HeaderValue::from_static("mem"));
        headers.insert("x-amz-meta-owner", HeaderValue::from_static("ops"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("11"));
        let ctx = write_context(&headers);
        assert_eq!(ctx.location_hint.as_deref(), Some("mem"));
        assert_eq!(ctx.user_metadata["owner"], "ops");
        assert_eq!(ctx.size_hint, Some(11));
        assert!(ctx.content_md5.is_none());
    }

    #[tokio::test]
    async fn bucket_without_constraint_takes_the_endpoint_location() {
        let fixture = Fixture::new();
        let app = app(&fixture).await;

        let resp = send(&app, request(Method::PUT, "/plain").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["locationConstraint"], "file");

        let resp = send(
            &app,
            request(Method::PUT, "/nowhere")
                .body(Body::from(r#"{"LocationConstraint":"mars"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "InvalidLocationConstraint");
    }

    #[tokio::test]
    async fn object_hint_header_routes_the_payload() {
        let fixture = Fixture::new();
        let app = app(&fixture).await;
        send(
            &app,
            request(Method::PUT, "/bucketfile")
                .body(Body::from(r#"{"LocationConstraint":"file"}"#))
                .unwrap(),
        )
        .await;

        let resp = send(
            &app,
            request(Method::PUT, "/bucketfile/plain")
                .body(Body::from("I am a body"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ETAG],
            "\"be747eb4b75517bf6b3cf7c5fbb62f3a\""
        );
        assert_eq!(fixture.arena_len(), 0);

        let resp = send(
            &app,
            request(Method::PUT, "/bucketfile/hinted")
                .header(LOCATION_HINT_HEADER, "mem")
                .header(CONTENT_MD5_HEADER, "vnR+tLdVF79rPPfF+7YvOg==")
                .body(Body::from("I am a body"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(fixture.arena_len(), 1);

        let resp = send(
            &app,
            request(Method::HEAD, "/bucketfile/hinted")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "11");
        assert_eq!(resp.headers()[LOCATION_HINT_HEADER], "mem");
    }

    #[tokio::test]
    async fn range_requests_return_partial_content() {
        let fixture = Fixture::new();
        let app = app(&fixture).await;
        send(&app, request(Method::PUT, "/ranged").body(Body::empty()).unwrap()).await;
        send(
            &app,
            request(Method::PUT, "/ranged/obj")
                .body(Body::from("I am a body"))
                .unwrap(),
        )
        .await;

        let resp = send(
            &app,
            request(Method::GET, "/ranged/obj")
                .header(header::RANGE, "bytes=5-")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 5-10/11");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"a body");

        let resp = send(
            &app,
            request(Method::GET, "/ranged/obj")
                .header(header::RANGE, "bytes=50-60")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn missing_resources_map_to_stable_codes() {
        let fixture = Fixture::new();
        let app = app(&fixture).await;

        let resp = send(&app, request(Method::GET, "/ghost/key").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "NoSuchBucket");

        send(&app, request(Method::PUT, "/present").body(Body::empty()).unwrap()).await;
        let resp = send(&app, request(Method::GET, "/present/key").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "NoSuchKey");

        let resp = send(
            &app,
            request(Method::DELETE, "/present").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
