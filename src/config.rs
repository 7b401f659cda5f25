use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::providers::anilist::ANILIST_API_URL;

pub const ENV_PREFIX: &str = "ANV_SYNC";
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &["https://vidlink.pro", "https://vidsrc.cc"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding `progress.json`; the platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub catalog_url: String,
    pub allowed_origins: Vec<String>,
    pub user_id: Option<String>,
    pub remote: RemoteSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            catalog_url: ANILIST_API_URL.to_string(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|origin| origin.to_string())
                .collect(),
            user_id: None,
            remote: RemoteSettings::default(),
        }
    }
}

impl Settings {
    /// Layers defaults, the TOML file at `path` (if present) and `ANV_SYNC_*`
    /// environment variables, in that order.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: &Path, env: Environment) -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                env.separator("__")
                    .prefix_separator("_")
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let data = toml::to_string_pretty(&Settings::default())
            .context("failed to serialize default settings")?;
        fs::write(path, data)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    Ok(base.join("anv-sync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn isolated_env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            Settings::load_with_env(&dir.path().join("absent.toml"), isolated_env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
user_id = "user-42"
allowed_origins = ["https://player.example"]

[remote]
base_url = "https://sync.example/api"
"#,
        )
        .unwrap();
        let settings = Settings::load_with_env(&path, isolated_env(&[])).unwrap();
        assert_eq!(settings.user_id.as_deref(), Some("user-42"));
        assert_eq!(settings.allowed_origins, vec!["https://player.example"]);
        assert_eq!(
            settings.remote.base_url.as_deref(),
            Some("https://sync.example/api")
        );
        assert_eq!(settings.catalog_url, ANILIST_API_URL);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "user_id = \"from-file\"\n").unwrap();
        let env = isolated_env(&[
            ("ANV_SYNC_USER_ID", "from-env"),
            ("ANV_SYNC_REMOTE__API_KEY", "secret"),
            ("ANV_SYNC_ALLOWED_ORIGINS", "https://a.example,https://b.example"),
        ]);
        let settings = Settings::load_with_env(&path, env).unwrap();
        assert_eq!(settings.user_id.as_deref(), Some("from-env"));
        assert_eq!(settings.remote.api_key.as_deref(), Some("secret"));
        assert_eq!(
            settings.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn written_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Settings::write_default(&path).unwrap();
        let settings = Settings::load_with_env(&path, isolated_env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
