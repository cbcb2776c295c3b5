use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use onedrive_core::{DEFAULT_SCOPES, OAuthClient};
use serde::Deserialize;

use crate::sync::engine::{EngineConfig, ListingMode};

const DEFAULT_MIRROR_DIR_NAME: &str = "OneDrive Mirror";
const DATA_DIR_NAME: &str = "onedrive-mirror";
const DEFAULT_TENANT: &str = "common";
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_STALE_RUNNING_SECS: u64 = 6 * 60 * 60;
const DEFAULT_TOKEN_SKEW_SECS: u64 = 60;

/// Application registration used for token refresh, in the
/// `app_credentials.json` layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppCredentials {
    #[serde(rename = "CLIENT_ID")]
    pub client_id: String,
    #[serde(rename = "TENANT_ID", default = "default_tenant")]
    pub tenant_id: String,
    #[serde(rename = "CLIENT_SECRET", default)]
    pub client_secret: Option<String>,
    #[serde(rename = "SCOPES", default)]
    scopes: Option<Scopes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Scopes {
    List(Vec<String>),
    Joined(String),
}

impl AppCredentials {
    pub fn scopes(&self) -> Vec<String> {
        match &self.scopes {
            Some(Scopes::List(list)) if !list.is_empty() => list.clone(),
            Some(Scopes::Joined(joined)) if !joined.trim().is_empty() => {
                joined.split_whitespace().map(str::to_string).collect()
            }
            _ => DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn oauth_client(&self) -> anyhow::Result<OAuthClient> {
        Ok(OAuthClient::new(
            self.tenant_id.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
        )?
        .with_scopes(self.scopes()))
    }
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub engine: EngineConfig,
    pub db_path: PathBuf,
    pub credentials: Option<AppCredentials>,
}

impl MirrorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = dirs::data_dir()
            .context("XDG data directory is unavailable")?
            .join(DATA_DIR_NAME);
        Self::from_vars(|name| std::env::var(name).ok(), &home, &data_dir)
    }

    pub fn from_vars<F>(var: F, home: &Path, data_dir: &Path) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mirror_root = var("ONEDRIVE_MIRROR_ROOT")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_MIRROR_DIR_NAME));
        let db_path = var("ONEDRIVE_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_dir.join("sync.db"));
        let listing = match var("ONEDRIVE_LISTING").as_deref().map(str::trim) {
            None | Some("") | Some("delta") => ListingMode::Delta,
            Some("children") => ListingMode::Children,
            Some(other) => anyhow::bail!("unknown ONEDRIVE_LISTING value: {other}"),
        };

        let mut engine = EngineConfig::new(mirror_root);
        engine.listing = listing;
        engine.download_concurrency = read_u64(
            &var,
            "ONEDRIVE_DOWNLOAD_CONCURRENCY",
            DEFAULT_DOWNLOAD_CONCURRENCY,
        ) as usize;
        engine.pass_deadline = var("ONEDRIVE_PASS_DEADLINE_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs);
        engine.stale_running_after = Duration::from_secs(read_u64(
            &var,
            "ONEDRIVE_STALE_RUNNING_SECS",
            DEFAULT_STALE_RUNNING_SECS,
        ));
        engine.token_skew_secs =
            read_u64(&var, "ONEDRIVE_TOKEN_SKEW_SECS", DEFAULT_TOKEN_SKEW_SECS) as i64;
        if read_bool(&var, "ONEDRIVE_WRITE_MANIFEST", true) {
            engine.manifest_dir = Some(data_dir.join("manifests"));
        }

        let credentials = match var("ONEDRIVE_CREDENTIALS_FILE") {
            Some(path) => Some(load_credentials(&expand_with_home(&path, home))?),
            None => var("ONEDRIVE_CLIENT_ID").map(|client_id| AppCredentials {
                client_id,
                tenant_id: var("ONEDRIVE_TENANT_ID").unwrap_or_else(default_tenant),
                client_secret: var("ONEDRIVE_CLIENT_SECRET"),
                scopes: var("ONEDRIVE_SCOPES").map(Scopes::Joined),
            }),
        };

        Ok(Self {
            engine,
            db_path,
            credentials,
        })
    }

    pub fn oauth_client(&self) -> anyhow::Result<Option<OAuthClient>> {
        self.credentials
            .as_ref()
            .map(AppCredentials::oauth_client)
            .transpose()
    }
}

pub fn load_credentials(path: &Path) -> anyhow::Result<AppCredentials> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read credentials file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("invalid credentials file {}", path.display()))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(var: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(var: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config =
            MirrorConfig::from_vars(vars(&[]), Path::new("/home/u"), Path::new("/data/om")).unwrap();

        assert_eq!(config.engine.mirror_root, PathBuf::from("/home/u/OneDrive Mirror"));
        assert_eq!(config.db_path, PathBuf::from("/data/om/sync.db"));
        assert_eq!(config.engine.listing, ListingMode::Delta);
        assert_eq!(config.engine.download_concurrency, 4);
        assert_eq!(config.engine.pass_deadline, None);
        assert_eq!(config.engine.token_skew_secs, 60);
        assert_eq!(config.engine.manifest_dir, Some(PathBuf::from("/data/om/manifests")));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = MirrorConfig::from_vars(
            vars(&[
                ("ONEDRIVE_MIRROR_ROOT", "~/mirror"),
                ("ONEDRIVE_LISTING", "children"),
                ("ONEDRIVE_DOWNLOAD_CONCURRENCY", "8"),
                ("ONEDRIVE_PASS_DEADLINE_SECS", "300"),
                ("ONEDRIVE_WRITE_MANIFEST", "off"),
                ("ONEDRIVE_CLIENT_ID", "client-1"),
                ("ONEDRIVE_SCOPES", "Files.Read offline_access"),
            ]),
            Path::new("/home/u"),
            Path::new("/data/om"),
        )
        .unwrap();

        assert_eq!(config.engine.mirror_root, PathBuf::from("/home/u/mirror"));
        assert_eq!(config.engine.listing, ListingMode::Children);
        assert_eq!(config.engine.download_concurrency, 8);
        assert_eq!(config.engine.pass_deadline, Some(Duration::from_secs(300)));
        assert!(config.engine.manifest_dir.is_none());
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.tenant_id, "common");
        assert_eq!(credentials.scopes(), vec!["Files.Read", "offline_access"]);
    }

    #[test]
    fn unknown_listing_mode_is_rejected() {
        let result = MirrorConfig::from_vars(
            vars(&[("ONEDRIVE_LISTING", "sideways")]),
            Path::new("/home/u"),
            Path::new("/data/om"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn credentials_file_accepts_scope_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app_credentials.json");
        std::fs::write(
            &path,
            r#"{"CLIENT_ID": "c", "TENANT_ID": "t", "SCOPES": ["Files.Read.All", "offline_access"]}"#,
        )
        .unwrap();

        let credentials = load_credentials(&path).unwrap();

        assert_eq!(credentials.client_id, "c");
        assert_eq!(credentials.tenant_id, "t");
        assert!(credentials.client_secret.is_none());
        assert_eq!(credentials.scopes(), vec!["Files.Read.All", "offline_access"]);
    }

    #[test]
    fn missing_scopes_fall_back_to_defaults() {
        let credentials: AppCredentials = serde_json::from_str(r#"{"CLIENT_ID": "c"}"#).unwrap();
        assert_eq!(
            credentials.scopes(),
            vec!["Files.Read.All", "offline_access", "User.Read"]
        );
    }

    #[test]
    fn expand_with_home_handles_tilde() {
        let home = Path::new("/home/u");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/u"));
        assert_eq!(expand_with_home("~/x", home), PathBuf::from("/home/u/x"));
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let var = vars(&[("N", "zero"), ("Z", "0")]);
        assert_eq!(read_u64(&var, "N", 7), 7);
        assert_eq!(read_u64(&var, "Z", 7), 7);
        assert!(read_bool(&var, "MISSING", true));
    }
}
