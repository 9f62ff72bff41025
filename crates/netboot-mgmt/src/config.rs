use netboot_iscsi::IscsiConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server settings: listen address, admin token and the iSCSI subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Address the admin API binds to.
    pub bind_addr: SocketAddr,
    /// Bearer token for `/api/v1`; unauthenticated when unset.
    pub admin_token: Option<String>,
    /// Image store, daemon and stall detection settings.
    pub iscsi: IscsiConfig,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            admin_token: None,
            iscsi: IscsiConfig::default(),
        }
    }
}

impl MgmtConfig {
    /// Loads a `.toml` or `.json` config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgmtConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgmtConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Applies `NETBOOT_ADMIN_TOKEN` and the iSCSI path/IP overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("NETBOOT_ADMIN_TOKEN").filter(|v| !v.is_empty()) {
            self.admin_token = Some(token);
        }
        self.iscsi.apply_env_overrides(lookup);
    }
}
