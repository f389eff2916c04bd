//! Process configuration (`firstcontact.toml`) and the operator-editable
//! greeting settings (`settings.toml`).

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod settings;

pub use {
    loader::{data_dir, discover_and_load, load_config, set_config_dir, settings_path},
    schema::{
        FirstContactConfig, OnboardingConfig, ServerConfig, SessionConfig, TransportConfig,
        TransportKind,
    },
    settings::{Settings, SettingsError, SettingsPatch, SettingsStore},
};
