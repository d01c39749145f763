use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::editor::InteractionMode;
use crate::processing::pool::DEFAULT_POOL_SIZE;
use crate::session::{DEFAULT_DEBOUNCE, PreviewBackend, SessionSettings};
use crate::state::{DEFAULT_RESULT_SIZE, MAX_RESULT_DIM, ResultSizePolicy};

const MAX_WORKERS: usize = 64;

#[derive(Debug, Default, Serialize, Deserialize)]
/// Persisted UI/application settings for Photo Cutter.
pub struct AppConfig {
    pub window_width: Option<f32>,
    pub window_height: Option<f32>,
    pub last_open_path: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
    pub preview_backend: Option<String>,
    pub interaction_mode: Option<InteractionMode>,
    /// `"fixed"` or `"half"`.
    pub result_size: Option<String>,
    pub fixed_result_size: Option<u32>,
    pub worker_count: Option<usize>,
    pub debounce_ms: Option<u64>,
}

impl AppConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("photo-cutter").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Self {
        toml::from_str(contents).unwrap_or_else(|err| {
            tracing::warn!("ignoring unreadable config: {err}");
            Self::default()
        })
    }

    /// Writes config to disk, ignoring filesystem/serialization errors.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(s) = toml::to_string_pretty(self) {
            let _ = std::fs::write(&path, s);
        }
    }

    pub fn size_policy(&self) -> ResultSizePolicy {
        let fixed = self
            .fixed_result_size
            .unwrap_or(DEFAULT_RESULT_SIZE)
            .clamp(1, MAX_RESULT_DIM);
        match self.result_size.as_deref().map(str::trim) {
            Some(raw) if raw.eq_ignore_ascii_case("half") => ResultSizePolicy::HalfSource,
            _ => ResultSizePolicy::Fixed(fixed),
        }
    }

    pub fn set_size_policy(&mut self, policy: ResultSizePolicy) {
        match policy {
            ResultSizePolicy::Fixed(size) => {
                self.result_size = Some("fixed".to_string());
                self.fixed_result_size = Some(size);
            }
            ResultSizePolicy::HalfSource => self.result_size = Some("half".to_string()),
        }
    }

    /// Engine settings with out-of-range values pulled back to sane bounds.
    pub fn session_settings(&self, backend: PreviewBackend) -> SessionSettings {
        SessionSettings {
            backend,
            mode: self.interaction_mode.unwrap_or_default(),
            size_policy: self.size_policy(),
            worker_count: self
                .worker_count
                .unwrap_or(DEFAULT_POOL_SIZE)
                .clamp(1, MAX_WORKERS),
            debounce: self
                .debounce_ms
                .map(|ms| Duration::from_millis(ms.min(2000)))
                .unwrap_or(DEFAULT_DEBOUNCE),
        }
    }
}
