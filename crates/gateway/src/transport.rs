//! Transport selection from `[transport]`.

use std::{path::Path, sync::Arc};

use {
    firstcontact_channels::Transport,
    firstcontact_config::{TransportConfig, TransportKind},
    firstcontact_whatsapp::BridgeTransport,
};

/// Kind used when `transport.kind` is unset.
pub const DEFAULT_KIND: TransportKind = if cfg!(feature = "native") {
    TransportKind::Native
} else {
    TransportKind::Bridge
};

pub fn resolve_kind(config: &TransportConfig) -> TransportKind {
    config.kind.unwrap_or(DEFAULT_KIND)
}

/// Build the configured transport. Native device keys go under `data_dir`.
pub fn build_transport(
    config: &TransportConfig,
    data_dir: &Path,
) -> anyhow::Result<Arc<dyn Transport>> {
    match resolve_kind(config) {
        TransportKind::Bridge => Ok(Arc::new(BridgeTransport::from_config(config))),
        TransportKind::Native => native(config, data_dir),
    }
}

#[cfg(feature = "native")]
fn native(config: &TransportConfig, data_dir: &Path) -> anyhow::Result<Arc<dyn Transport>> {
    Ok(Arc::new(firstcontact_whatsapp::NativeTransport::new(
        data_dir,
        config.request_timeout(),
    )))
}

#[cfg(not(feature = "native"))]
fn native(_config: &TransportConfig, _data_dir: &Path) -> anyhow::Result<Arc<dyn Transport>> {
    anyhow::bail!(
        "transport.kind = \"native\" needs a build with `--features native`; \
         set transport.kind = \"bridge\" to use an external bridge"
    )
}

/// One-line summary for the startup banner.
pub fn describe(config: &TransportConfig, data_dir: &Path) -> String {
    match resolve_kind(config) {
        TransportKind::Bridge => format!("transport: bridge at {}", config.bridge_url),
        TransportKind::Native => format!(
            "transport: native, device store in {}",
            data_dir.display()
        ),
    }
}
