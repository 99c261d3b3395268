//! Device identities derived from an index and a scope's prefixes.

use std::fmt;

use fleetsim_core::config::{CredentialPrefixes, DEFAULT_INDEX_WIDTH};

/// Broker-facing identity of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub index: u32,
    pub device_id: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Zero-pad `index` to `width` digits.
pub fn pad_index(index: u32, width: usize) -> String {
    format!("{:0width$}", index, width = width)
}

impl DeviceIdentity {
    /// Identity with the default two-digit padding.
    pub fn derive(index: u32, prefixes: &CredentialPrefixes) -> Self {
        Self::with_width(index, prefixes, DEFAULT_INDEX_WIDTH)
    }

    pub fn with_width(index: u32, prefixes: &CredentialPrefixes, width: usize) -> Self {
        let suffix = pad_index(index, width);
        Self {
            index,
            device_id: format!("{}{}", prefixes.device(), suffix),
            client_id: format!("{}{}", prefixes.client_id_or_default(), suffix),
            username: format!("{}{}", prefixes.username(), suffix),
            password: format!("{}{}", prefixes.password(), suffix),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.client_id)
    }
}
