//! Location-constraint configuration as loaded from the placement config file.
//!
//! The file either carries a `locationConstraints` map (one entry per backend
//! location, plus a `restEndpoints` table) or, in the legacy layout, only a
//! `regions` list.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Root of the placement configuration file.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocationConfig {
    /// Named backend locations. Absent in the legacy layout.
    #[serde(default)]
    pub location_constraints: Option<BTreeMap<String, LocationConstraint>>,

    /// Request endpoint (host) to default location name.
    #[serde(default)]
    pub rest_endpoints: BTreeMap<String, String>,

    /// Legacy region list. Its presence selects the single-backend mode.
    #[serde(default)]
    pub regions: Option<Vec<String>>,

    /// Optional indexing webhook fed with newly written objects.
    #[serde(default)]
    pub indexer: Option<IndexerConfig>,
}

/// One configured location: a backend kind plus its connection details.
#[derive(Deserialize, Clone, Debug)]
pub struct LocationConstraint {
    #[serde(rename = "type")]
    pub kind: LocationKind,

    #[serde(default)]
    pub details: LocationDetails,
}

/// Closed set of backend kinds a location may name.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocationKind {
    #[serde(rename = "mem")]
    Memory,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "scality")]
    ContentAddressed,
    #[serde(rename = "aws_s3")]
    ExternalCloud,
    #[serde(rename = "virtual-user-metadata")]
    VirtualUserMetadata,
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "mem",
            Self::File => "file",
            Self::ContentAddressed => "scality",
            Self::ExternalCloud => "aws_s3",
            Self::VirtualUserMetadata => "virtual-user-metadata",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct LocationDetails {
    #[serde(default)]
    pub connector: Option<ConnectorDetails>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ConnectorDetails {
    #[serde(default)]
    pub sproxyd: Option<SproxydDetails>,
}

/// Connection details of a content-addressed cluster.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SproxydDetails {
    /// `host:port` members tried in order.
    pub bootstrap: Vec<String>,

    /// Placement class hint. Left to the cluster default when unset.
    #[serde(default)]
    pub chord_cos: Option<u8>,

    /// Route prefix on each member.
    #[serde(default)]
    pub path: Option<String>,
}

/// Indexing webhook settings.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    pub endpoint: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Content-type prefixes that get indexed.
    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_max_polls() -> u32 {
    40
}

fn default_content_types() -> Vec<String> {
    vec!["video/".to_string()]
}
