//! Binds location-constraint names to backend clients.
//!
//! The registry is built once at start-up from the location config and is
//! read-only afterwards. Memory and file locations share the process-wide
//! built-in backends; every content-addressed location gets its own client.

use crate::{
    backends::{
        BackendClient, content_addressed::ContentAddressedBackend, file::FileBackend,
        memory::MemoryBackend,
    },
    models::location::{LocationConfig, LocationConstraint, LocationKind},
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{error, info};

/// Name the single default backend is registered under in legacy mode.
pub const LEGACY_LOCATION: &str = "legacy";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("location config sets both `locationConstraints` and `regions`")]
    AmbiguousMode,
    #[error("location config sets neither `locationConstraints` nor `regions`")]
    MissingMode,
    #[error("location `{name}` uses unsupported backend kind `{kind}`")]
    UnsupportedKind { name: String, kind: LocationKind },
    #[error("location `{name}` is missing {what}")]
    MissingDetails { name: String, what: &'static str },
    #[error("rest endpoint `{endpoint}` maps to unknown location `{location}`")]
    UnknownEndpointLocation { endpoint: String, location: String },
    #[error("location `{0}` is not registered")]
    UnknownLocation(String),
    #[error("could not build client for location `{name}`: {source}")]
    Client {
        name: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Which placement mechanism the process runs with. Chosen once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementMode {
    LocationConstraints,
    /// Region list only. Every write goes to the default backend.
    Legacy { regions: Vec<String> },
}

/// Process-wide backend singletons bound by `mem` and `file` locations.
#[derive(Clone)]
pub struct BuiltinBackends {
    pub memory: Arc<MemoryBackend>,
    pub file: Arc<FileBackend>,
}

pub struct LocationRegistry {
    clients: BTreeMap<String, Arc<dyn BackendClient>>,
    rest_endpoints: BTreeMap<String, String>,
    mode: PlacementMode,
}

impl LocationRegistry {
    pub fn build(config: &LocationConfig, builtins: &BuiltinBackends) -> Result<Self, ConfigError> {
        match (&config.location_constraints, &config.regions) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousMode),
            (None, None) => Err(ConfigError::MissingMode),
            (None, Some(regions)) => {
                info!(regions = regions.len(), "placement running in legacy region mode");
                let file: Arc<dyn BackendClient> = builtins.file.clone();
                Ok(Self {
                    clients: BTreeMap::from([(LEGACY_LOCATION.to_string(), file)]),
                    rest_endpoints: BTreeMap::new(),
                    mode: PlacementMode::Legacy {
                        regions: regions.clone(),
                    },
                })
            }
            (Some(constraints), None) => {
                let mut clients = BTreeMap::new();
                for (name, constraint) in constraints {
                    let client = Self::client_for(name, constraint, builtins)?;
                    info!(location = %name, kind = %constraint.kind, "registered location");
                    clients.insert(name.clone(), client);
                }
                for (endpoint, location) in &config.rest_endpoints {
                    if !clients.contains_key(location) {
                        return Err(ConfigError::UnknownEndpointLocation {
                            endpoint: endpoint.clone(),
                            location: location.clone(),
                        });
                    }
                }
                Ok(Self {
                    clients,
                    rest_endpoints: config.rest_endpoints.clone(),
                    mode: PlacementMode::LocationConstraints,
                })
            }
        }
    }

    fn client_for(
        name: &str,
        constraint: &LocationConstraint,
        builtins: &BuiltinBackends,
    ) -> Result<Arc<dyn BackendClient>, ConfigError> {
        match constraint.kind {
            LocationKind::Memory => Ok(builtins.memory.clone()),
            LocationKind::File => Ok(builtins.file.clone()),
            LocationKind::ContentAddressed => {
                let sproxyd = constraint
                    .details
                    .connector
                    .as_ref()
                    .and_then(|c| c.sproxyd.as_ref())
                    .ok_or_else(|| ConfigError::MissingDetails {
                        name: name.to_string(),
                        what: "`details.connector.sproxyd`",
                    })?;
                if sproxyd.bootstrap.is_empty() {
                    return Err(ConfigError::MissingDetails {
                        name: name.to_string(),
                        what: "a non-empty bootstrap list",
                    });
                }
                let client =
                    ContentAddressedBackend::new(sproxyd).map_err(|source| ConfigError::Client {
                        name: name.to_string(),
                        source,
                    })?;
                Ok(Arc::new(client))
            }
            kind @ (LocationKind::ExternalCloud | LocationKind::VirtualUserMetadata) => {
                Err(ConfigError::UnsupportedKind {
                    name: name.to_string(),
                    kind,
                })
            }
        }
    }

    /// Registry over prebuilt clients, for tests that need fakes.
    #[cfg(test)]
    pub fn from_clients(
        clients: impl IntoIterator<Item = (String, Arc<dyn BackendClient>)>,
        rest_endpoints: BTreeMap<String, String>,
    ) -> Self {
        Self {
            clients: clients.into_iter().collect(),
            rest_endpoints,
            mode: PlacementMode::LocationConstraints,
        }
    }

    pub fn mode(&self) -> &PlacementMode {
        &self.mode
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self.mode, PlacementMode::Legacy { .. })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Client bound to `name`. An unknown name is a configuration fault.
    pub fn client(&self, name: &str) -> Result<Arc<dyn BackendClient>, ConfigError> {
        match self.clients.get(name) {
            Some(client) => Ok(client.clone()),
            None => {
                error!(location = %name, "location is not registered; configuration is inconsistent");
                Err(ConfigError::UnknownLocation(name.to_string()))
            }
        }
    }

    /// Location the endpoint table assigns to `endpoint`.
    pub fn endpoint_location(&self, endpoint: &str) -> Option<&str> {
        self.rest_endpoints.get(endpoint).map(String::as_str)
    }

    /// The single backend every write uses in legacy mode.
    pub fn default_location(&self) -> Option<&str> {
        self.is_legacy().then_some(LEGACY_LOCATION)
    }

    /// Configured regions. Empty outside legacy mode.
    pub fn regions(&self) -> &[String] {
        match &self.mode {
            PlacementMode::Legacy { regions } => regions,
            PlacementMode::LocationConstraints => &[],
        }
    }

    pub fn locations(&self) -> impl Iterator<Item = (&str, &Arc<dyn BackendClient>)> {
        self.clients.iter().map(|(name, client)| (name.as_str(), client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::location::LocationConfig;
    use tempfile::TempDir;

    fn builtins(dir: &TempDir) -> BuiltinBackends {
        BuiltinBackends {
            memory: Arc::new(MemoryBackend::new()),
            file: Arc::new(FileBackend::new(dir.path())),
        }
    }

    fn parse(raw: &str) -> LocationConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn binds_builtin_singletons_by_kind() {
        let dir = TempDir::new().unwrap();
        let cfg = parse(
            r#"{
                "locationConstraints": {
                    "mem": { "type": "mem" },
                    "mem-2": { "type": "mem" },
                    "file": { "type": "file" }
                },
                "restEndpoints": { "localhost": "file" }
            }"#,
        );
        let registry = LocationRegistry::build(&cfg, &builtins(&dir)).unwrap();
        assert!(!registry.is_legacy());
        assert_eq!(registry.client("mem").unwrap().kind(), LocationKind::Memory);
        assert_eq!(registry.client("file").unwrap().kind(), LocationKind::File);
        assert!(Arc::ptr_eq(
            &registry.client("mem").unwrap(),
            &registry.client("mem-2").unwrap()
        ));
        assert_eq!(registry.endpoint_location("localhost"), Some("file"));
        assert!(matches!(
            registry.client("nowhere"),
            Err(ConfigError::UnknownLocation(_))
        ));
    }

    #[test]
    fn rejects_unsupported_and_incomplete_locations() {
        let dir = TempDir::new().unwrap();
        let cloud = parse(r#"{ "locationConstraints": { "s3": { "type": "aws_s3" } } }"#);
        assert!(matches!(
            LocationRegistry::build(&cloud, &builtins(&dir)),
            Err(ConfigError::UnsupportedKind { .. })
        ));

        let ring = parse(r#"{ "locationConstraints": { "ring": { "type": "scality" } } }"#);
        assert!(matches!(
            LocationRegistry::build(&ring, &builtins(&dir)),
            Err(ConfigError::MissingDetails { .. })
        ));

        let dangling = parse(
            r#"{
                "locationConstraints": { "mem": { "type": "mem" } },
                "restEndpoints": { "localhost": "file" }
            }"#,
        );
        assert!(matches!(
            LocationRegistry::build(&dangling, &builtins(&dir)),
            Err(ConfigError::UnknownEndpointLocation { .. })
        ));
    }

    #[test]
    fn mode_is_chosen_from_the_config_layout() {
        let dir = TempDir::new().unwrap();
        let legacy = parse(r#"{ "regions": ["us-east-1"] }"#);
        let registry = LocationRegistry::build(&legacy, &builtins(&dir)).unwrap();
        assert!(registry.is_legacy());
        assert_eq!(registry.default_location(), Some(LEGACY_LOCATION));
        assert_eq!(registry.regions(), ["us-east-1".to_string()]);

        let both = parse(r#"{ "regions": [], "locationConstraints": {} }"#);
        assert!(matches!(
            LocationRegistry::build(&both, &builtins(&dir)),
            Err(ConfigError::AmbiguousMode)
        ));
        assert!(matches!(
            LocationRegistry::build(&parse("{}"), &builtins(&dir)),
            Err(ConfigError::MissingMode)
        ));
    }
}
