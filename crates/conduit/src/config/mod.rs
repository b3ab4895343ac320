mod base;
mod settings;

pub use base::{config_dir, data_dir, ConfigError, ConfigManager};
pub use settings::{LimitSettings, Settings, API_KEY_ENV};
