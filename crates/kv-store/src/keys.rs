//! Key layout of the store

/// Cluster document
pub const KEY_CLUSTER: &str = "/cluster";
/// Cluster constraints
pub const KEY_CONSTRAINTS: &str = "/constraints";
/// Layout version of the nodes
pub const KEY_CONFIG_VERSION: &str = "/config-version";
/// Credential broker connection settings
pub const KEY_VAULT: &str = "/vault";
/// CA certificates by name
pub const KEY_CA_PREFIX: &str = "/ca/";
/// Service account signing certificate
pub const KEY_SERVICE_ACCOUNT_CERT: &str = "/service-account/cert";
/// Service account signing key
pub const KEY_SERVICE_ACCOUNT_KEY: &str = "/service-account/key";
/// Operation records by id
pub const KEY_RECORDS_PREFIX: &str = "/records/";
/// Last assigned record id
pub const KEY_RECORD_ID: &str = "/record-id";
/// Server status of the leader
pub const KEY_STATUS: &str = "/status";
/// Reboot queue entries by index
pub const KEY_REBOOTS_PREFIX: &str = "/reboots/";
/// Last assigned reboot queue index
pub const KEY_REBOOTS_WRITE_INDEX: &str = "/reboots-write-index";
/// Reboot queue switch
pub const KEY_REBOOTS_DISABLED: &str = "/reboots-disabled";
/// Repair queue entries by index
pub const KEY_REPAIRS_PREFIX: &str = "/repairs/";
/// Last assigned repair queue index
pub const KEY_REPAIRS_WRITE_INDEX: &str = "/repairs-write-index";
/// Repair queue switch
pub const KEY_REPAIRS_DISABLED: &str = "/repairs-disabled";
/// Election name; leader keys live under `/leader/`
pub const KEY_LEADER: &str = "/leader";
pub use cluster_spec::RESOURCE_PREFIX as KEY_RESOURCE_PREFIX;

/// Record key for an id, zero padded so keys sort numerically
#[must_use]
pub fn record_key(id: i64) -> String {
    format!("{KEY_RECORDS_PREFIX}{id:020}")
}

/// Reboot queue entry key, zero padded
#[must_use]
pub fn reboots_key(index: i64) -> String {
    format!("{KEY_REBOOTS_PREFIX}{index:020}")
}

/// Repair queue entry key, zero padded
#[must_use]
pub fn repairs_key(index: i64) -> String {
    format!("{KEY_REPAIRS_PREFIX}{index:020}")
}

/// Key of a named CA certificate
#[must_use]
pub fn ca_key(name: &str) -> String {
    format!("{KEY_CA_PREFIX}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_zero_padded() {
        assert_eq!(record_key(42), "/records/00000000000000000042");
        assert_eq!(reboots_key(7).len(), "/reboots/".len() + 20);
        assert!(repairs_key(9) < repairs_key(10));
    }
}
