use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;
use structopt_toml::StructOptToml;

use datastore::ComplianceMode;

#[derive(StructOpt, Debug, Clone, StructOptToml, Deserialize, Serialize)]
#[structopt(name = "odata-server")]
#[serde(deny_unknown_fields, default)]
pub struct Opt {
    /// API server listen address.
    #[structopt(short, long, default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Path prefix prepended to every registered route.
    #[structopt(long, default_value = "/odata/")]
    pub route_prefix: String,

    /// Backend driver: `postgres`, `mysql`, or `oracle`.
    #[structopt(long, default_value = "postgres")]
    pub driver: String,
    #[structopt(long, default_value = "localhost")]
    pub db_host: String,
    #[structopt(long, default_value = "5432")]
    pub db_port: u16,
    #[structopt(long, default_value = "odata")]
    pub db_user: String,
    #[structopt(long, env = "ODATA_DB_PASSWORD", default_value = "")]
    pub db_password: String,
    #[structopt(long, default_value = "odata")]
    pub db_name: String,

    /// Maximum number of open pool connections; 0 selects the pool
    /// library's default.
    #[structopt(long, default_value = "0")]
    pub pool_max_open: u32,
    /// Maximum number of idle pool connections; 0 selects the pool
    /// library's default.
    #[structopt(long, default_value = "0")]
    pub pool_max_idle: u32,
    /// Connection max lifetime in seconds; 0 defaults to 5 minutes, to
    /// avoid stale-idle reuse against a backend that silently drops long-
    /// lived connections.
    #[structopt(long, default_value = "0")]
    pub pool_max_lifetime_secs: u64,
    /// Connection max idle time in seconds; 0 defaults to 5 minutes.
    #[structopt(long, default_value = "0")]
    pub pool_max_idle_time_secs: u64,

    /// Compliance mode governing unknown/duplicate `$`-prefixed query
    /// options: `strict`, `ignore-unknown`, or `ignore-duplicate`.
    #[structopt(long, default_value = "strict")]
    pub compliance_mode: String,

    /// Policy cap on `$top`.
    #[structopt(long, default_value = "1000")]
    pub max_top: u64,
    /// Policy cap on `$expand` nesting depth.
    #[structopt(long, default_value = "5")]
    pub max_expand_depth: u32,

    /// Path to a JSON file holding the entity metadata registry, an array of
    /// entity definitions deserialized straight into
    /// `datastore::metadata::EntityMetadata`.
    #[structopt(long, default_value = "schema.json")]
    pub schema: PathBuf,

    /// Read default configuration from this TOML file.
    #[structopt(long, short)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Print the fully merged configuration as JSON and exit.
    #[structopt(long)]
    #[serde(skip)]
    pub show_config: bool,
}

impl Opt {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read(path).await?;
        let content = std::str::from_utf8(&content)?;
        Self::from_args_with_toml(content).map_err(|e| anyhow!(e.to_string()))
    }

    pub fn compliance_mode(&self) -> Result<ComplianceMode> {
        match self.compliance_mode.as_str() {
            "strict" => Ok(ComplianceMode::Strict),
            "ignore-unknown" => Ok(ComplianceMode::IgnoreUnknownKeywords),
            "ignore-duplicate" => Ok(ComplianceMode::IgnoreDuplicateKeywords),
            other => Err(anyhow!("unknown compliance mode `{other}`")),
        }
    }

    /// Applies the "defaults to 5 minutes if zero" rule from the pool
    /// configuration contract.
    pub fn pool_max_lifetime(&self) -> Duration {
        if self.pool_max_lifetime_secs == 0 {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(self.pool_max_lifetime_secs)
        }
    }

    pub fn pool_max_idle_time(&self) -> Duration {
        if self.pool_max_idle_time_secs == 0 {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(self.pool_max_idle_time_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_lifetime_defaults_to_five_minutes() {
        let opt = Opt::from_iter_safe(["odata-server"]).unwrap();
        assert_eq!(opt.pool_max_lifetime(), Duration::from_secs(300));
    }

    #[test]
    fn nonzero_lifetime_is_honored() {
        let opt = Opt::from_iter_safe(["odata-server", "--pool-max-lifetime-secs", "60"]).unwrap();
        assert_eq!(opt.pool_max_lifetime(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_compliance_mode_is_rejected() {
        let opt = Opt::from_iter_safe(["odata-server", "--compliance-mode", "bogus"]).unwrap();
        assert!(opt.compliance_mode().is_err());
    }
}
