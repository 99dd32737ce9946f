use crate::models::location::LocationConfig;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fs, path::Path};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Root of the built-in file backend.
    pub storage_dir: String,
    pub database_url: String,
    /// JSON file describing locations, endpoints and the optional indexer.
    pub location_config: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-backend placement gateway")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory backing the `file` location (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Location config file (overrides OBJECT_STORE_LOCATION_CONFIG)
    #[arg(long)]
    pub location_config: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let env_host = env::var("OBJECT_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("OBJECT_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing OBJECT_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 8000,
            Err(err) => return Err(err).context("reading OBJECT_STORE_PORT"),
        };
        let env_storage =
            env::var("OBJECT_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/placement.db".into());
        let env_locations = env::var("OBJECT_STORE_LOCATION_CONFIG")
            .unwrap_or_else(|_| "./config/locations.json".into());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            location_config: args.location_config.unwrap_or(env_locations),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read and parse the location config file.
    pub fn load_locations(&self) -> Result<LocationConfig> {
        load_location_config(Path::new(&self.location_config))
    }
}

pub fn load_location_config(path: &Path) -> Result<LocationConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading location config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing location config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn location_config_file_is_parsed() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "locationConstraints": {{ "mem": {{ "type": "mem", "details": {{}} }} }},
                "restEndpoints": {{ "localhost": "mem" }}
            }}"#
        )
        .unwrap();

        let config = load_location_config(file.path()).unwrap();
        assert!(config.location_constraints.unwrap().contains_key("mem"));
        assert_eq!(config.rest_endpoints["localhost"], "mem");
    }

    #[test]
    fn unreadable_or_malformed_config_reports_the_path() {
        let err = load_location_config(Path::new("/nonexistent/locations.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/locations.json"));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = load_location_config(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing location config"));
    }
}
