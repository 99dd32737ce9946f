//! Per-request placement inputs and the precedence rule that picks one location.

use crate::{errors::PlacementError, services::registry::LocationRegistry};
use tracing::{debug, trace};

/// Placement inputs of one write: object hint, bucket constraint, request endpoint.
///
/// Built fresh for every call and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    object_location_constraint: Option<String>,
    bucket_location_constraint: Option<String>,
    request_endpoint: String,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl BackendInfo {
    pub fn new(object_lc: Option<&str>, bucket_lc: Option<&str>, request_endpoint: &str) -> Self {
        Self {
            object_location_constraint: non_empty(object_lc).map(str::to_string),
            bucket_location_constraint: non_empty(bucket_lc).map(str::to_string),
            request_endpoint: request_endpoint.to_string(),
        }
    }

    pub fn object_location_constraint(&self) -> Option<&str> {
        self.object_location_constraint.as_deref()
    }

    pub fn bucket_location_constraint(&self) -> Option<&str> {
        self.bucket_location_constraint.as_deref()
    }

    pub fn request_endpoint(&self) -> &str {
        &self.request_endpoint
    }

    /// Whether every supplied hint names something the registry knows.
    ///
    /// Always false in legacy mode, where hints are not honored at all.
    pub fn are_valid_backend_parameters(
        registry: &LocationRegistry,
        object_lc: Option<&str>,
        bucket_lc: Option<&str>,
        request_endpoint: &str,
    ) -> bool {
        if registry.is_legacy() {
            return false;
        }
        if let Some(lc) = non_empty(object_lc).filter(|lc| !registry.contains(lc)) {
            debug!(location = %lc, "object location constraint is not registered");
            return false;
        }
        if let Some(lc) = non_empty(bucket_lc).filter(|lc| !registry.contains(lc)) {
            debug!(location = %lc, "bucket location constraint is not registered");
            return false;
        }
        if !request_endpoint.is_empty() && registry.endpoint_location(request_endpoint).is_none() {
            debug!(endpoint = %request_endpoint, "request endpoint has no location mapping");
            return false;
        }
        true
    }

    /// Object hint, then bucket constraint, then the endpoint table. Unregistered
    /// names are skipped; nothing resolving is an invalid argument.
    pub fn controlling_location_constraint(
        &self,
        registry: &LocationRegistry,
    ) -> Result<String, PlacementError> {
        if let Some(lc) = self.object_location_constraint() {
            if registry.contains(lc) {
                trace!(location = %lc, "placement from object location constraint");
                return Ok(lc.to_string());
            }
        }
        if let Some(lc) = self.bucket_location_constraint() {
            if registry.contains(lc) {
                trace!(location = %lc, "placement from bucket location constraint");
                return Ok(lc.to_string());
            }
        }
        if let Some(lc) = registry.endpoint_location(&self.request_endpoint) {
            trace!(location = %lc, endpoint = %self.request_endpoint, "placement from endpoint table");
            return Ok(lc.to_string());
        }
        Err(PlacementError::InvalidArgument(format!(
            "no location constraint resolves for endpoint `{}`",
            self.request_endpoint
        )))
    }

    /// Validate the hints and resolve the controlling location.
    ///
    /// In legacy mode the hints are ignored and the default backend is used.
    pub fn resolve(
        registry: &LocationRegistry,
        object_lc: Option<&str>,
        bucket_lc: Option<&str>,
        request_endpoint: &str,
    ) -> Result<String, PlacementError> {
        if let Some(default) = registry.default_location() {
            return Ok(default.to_string());
        }
        if !Self::are_valid_backend_parameters(registry, object_lc, bucket_lc, request_endpoint) {
            let offending = non_empty(object_lc)
                .filter(|lc| !registry.contains(lc))
                .or_else(|| non_empty(bucket_lc).filter(|lc| !registry.contains(lc)))
                .unwrap_or(request_endpoint);
            return Err(PlacementError::InvalidLocationConstraint(
                offending.to_string(),
            ));
        }
        Self::new(object_lc, bucket_lc, request_endpoint).controlling_location_constraint(registry)
    }
}
