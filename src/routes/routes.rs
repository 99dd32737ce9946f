//! Defines routes for bucket, object and multipart operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}`: create bucket (`{"LocationConstraint": ..}` body)
//!   - `DELETE /{bucket}`: delete bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: put object; `?partNumber&uploadId` uploads a part
//!   - `GET    /{bucket}/{*key}`: get object; `?uploadId` lists parts
//!   - `HEAD   /{bucket}/{*key}`: retrieve metadata only
//!   - `DELETE /{bucket}/{*key}`: delete object; `?uploadId` aborts
//!   - `POST   /{bucket}/{*key}`: `?uploads` initiates, `?uploadId` completes
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, post_object,
            put_object,
        },
    },
    services::AppContext,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router. Handlers share one `AppContext`.
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/{bucket}/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(post_object),
        )
        .route("/{bucket}", put(create_bucket).delete(delete_bucket))
}
