use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DeployhookConfig {
    /// Address the HTTP server listens on
    #[serde(default = "default_address")]
    pub address: IpAddr,
    /// Port the HTTP server listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// File where one JSON line is appended per deployment attempt
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    #[serde(default)]
    pub deploy: DeploySettings,
    /// Repositories allowed to trigger deployments, keyed by `owner/repo`
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploySettings {
    /// Program used to run deploy scripts, as `<interpreter> <script>`
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Kill a deployment still running after this many seconds. Unset means no limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Never run two deployments of the same repository at the same time.
    #[serde(default = "default_true")]
    pub serialize_per_repository: bool,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: None,
            serialize_per_repository: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Shared secret used to sign webhook payloads
    #[serde(default)]
    pub secret: String,
    /// When false, every event for this repository is trusted
    #[serde(default = "default_true", alias = "verify")]
    pub verify_signature: bool,
    /// Only pushes to this branch trigger a deployment
    pub branch: String,
    /// Human readable name, exported to the deploy script as `PROJECT_NAME`
    pub project_name: String,
    /// Script run on every matching push
    pub deploy_script: PathBuf,
}

impl DeployhookConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config_file =
            File::open(path).with_context(|| format!("couldn't open {}:", path.display()))?;
        let config: DeployhookConfig = serde_yaml::from_reader(BufReader::new(config_file))
            .context("couldn't parse config file")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (identifier, repo) in &self.repositories {
            if repo.verify_signature && repo.secret.is_empty() {
                bail!(
                    "repository `{}` verifies signatures but has no secret",
                    identifier
                );
            }
        }

        Ok(())
    }
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9000
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("deployments.log")
}

fn default_interpreter() -> String {
    "bash".to_owned()
}

fn default_true() -> bool {
    true
}
