//! Credential broker settings stored at `/vault`

use serde::{Deserialize, Serialize};

/// Connection settings for the Vault PKI backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Base URL, e.g. `https://vault.example:8200`
    pub endpoint: String,

    /// PEM of the CA that signed the Vault server certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,

    /// Role ID of the AppRole
    pub role_id: String,
    /// Secret ID of the AppRole
    pub secret_id: String,
}
