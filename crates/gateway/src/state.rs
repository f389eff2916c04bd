use std::sync::Arc;

use {
    firstcontact_config::SettingsStore,
    firstcontact_whatsapp::SessionManager,
};

use crate::auth::ResolvedAuth;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub settings: Arc<SettingsStore>,
    pub auth: Arc<ResolvedAuth>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(
        manager: Arc<SessionManager>,
        settings: Arc<SettingsStore>,
        auth: ResolvedAuth,
    ) -> Self {
        Self {
            manager,
            settings,
            auth: Arc::new(auth),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
