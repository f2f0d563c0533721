use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::OwnerId;
use tracing::warn;

use crate::grid::GridConfig;

pub const SETTINGS_FILE: &str = "reach.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub owner_id: String,
    pub database_url: String,
    pub debounce_ms: u64,
    pub page_size: usize,
    pub sort_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: None,
            api_key: None,
            owner_id: "demo-owner".into(),
            database_url: "sqlite://./data/reach.db".into(),
            debounce_ms: 500,
            page_size: 50,
            sort_key: "name".into(),
        }
    }
}

impl Settings {
    pub fn owner_id(&self) -> OwnerId {
        OwnerId::new(self.owner_id.clone())
    }

    pub fn grid_config(&self) -> GridConfig {
        GridConfig {
            owner_id: self.owner_id(),
            search_debounce: Duration::from_millis(self.debounce_ms),
            page_size: self.page_size.max(1),
            sort_key: self.sort_key.clone(),
        }
    }
}

/// Keys accepted in `reach.toml`. Anything unset keeps its default.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    backend_url: Option<String>,
    api_key: Option<String>,
    owner_id: Option<String>,
    database_url: Option<String>,
    debounce_ms: Option<u64>,
    page_size: Option<usize>,
    sort_key: Option<String>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the file at `path` if it exists, then environment
/// variables. For each setting the `APP__` alias wins over the plain name.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), error = %err, "settings: ignoring unreadable file"),
        }
    }

    let lookup = |plain: &str, alias: &str| env(alias).or_else(|| env(plain));

    if let Some(v) = lookup("REACH_BACKEND_URL", "APP__BACKEND_URL") {
        settings.backend_url = Some(v);
    }
    if let Some(v) = lookup("REACH_API_KEY", "APP__API_KEY") {
        settings.api_key = Some(v);
    }
    if let Some(v) = lookup("REACH_OWNER_ID", "APP__OWNER_ID") {
        settings.owner_id = v;
    }
    if let Some(v) = lookup("DATABASE_URL", "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("REACH_DEBOUNCE_MS", "APP__DEBOUNCE_MS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.debounce_ms = parsed,
            Err(_) => warn!(value = %v, "settings: debounce_ms is not a number"),
        }
    }
    if let Some(v) = lookup("REACH_PAGE_SIZE", "APP__PAGE_SIZE") {
        match v.parse::<usize>() {
            Ok(parsed) if parsed > 0 => settings.page_size = parsed,
            _ => warn!(value = %v, "settings: page_size must be a positive number"),
        }
    }
    if let Some(v) = lookup("REACH_SORT_KEY", "APP__SORT_KEY") {
        settings.sort_key = v;
    }

    settings
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if file_cfg.backend_url.is_some() {
        settings.backend_url = file_cfg.backend_url;
    }
    if file_cfg.api_key.is_some() {
        settings.api_key = file_cfg.api_key;
    }
    if let Some(v) = file_cfg.owner_id {
        settings.owner_id = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.debounce_ms {
        settings.debounce_ms = v;
    }
    if let Some(v) = file_cfg.page_size.filter(|size| *size > 0) {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.sort_key {
        settings.sort_key = v;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn temp_file(contents: &str) -> std::path::PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("reach_settings_test_{suffix}.toml"));
        fs::write(&path, contents).expect("write settings");
        path
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = load_settings_from(Path::new("/nonexistent/reach.toml"), |_| None);
        assert_eq!(settings, Settings::default());

        let grid = settings.grid_config();
        assert_eq!(grid.search_debounce, Duration::from_millis(500));
        assert_eq!(grid.page_size, 50);
        assert_eq!(grid.sort_key, "name");
    }

    #[test]
    fn file_then_env_with_app_alias_winning() {
        let path = temp_file(
            "backend_url = \"https://reach.example.com\"\nowner_id = \"from-file\"\npage_size = 25\n",
        );
        let env_vars: HashMap<&str, &str> = [
            ("REACH_OWNER_ID", "from-env"),
            ("APP__OWNER_ID", "from-alias"),
            ("REACH_DEBOUNCE_MS", "250"),
            ("REACH_PAGE_SIZE", "zero"),
        ]
        .into_iter()
        .collect();

        let settings = load_settings_from(&path, |key| env_vars.get(key).map(|v| v.to_string()));
        fs::remove_file(&path).expect("cleanup");

        assert_eq!(settings.backend_url.as_deref(), Some("https://reach.example.com"));
        assert_eq!(settings.owner_id, "from-alias");
        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.debounce_ms, 250);
        assert_eq!(settings.grid_config().owner_id, OwnerId::new("from-alias"));
    }

    #[test]
    fn malformed_file_is_ignored() {
        let path = temp_file("page_size = \"lots\"\n");
        let settings = load_settings_from(&path, |_| None);
        fs::remove_file(&path).expect("cleanup");
        assert_eq!(settings.page_size, 50);
    }
}
