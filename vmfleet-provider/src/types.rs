//! Backend-agnostic result types returned by every provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bootable disk image resident on a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudImage {
    /// Backend identifier; equal to `name` where the backend has no ids
    pub id: String,
    pub name: String,
    /// Backend-defined status string (empty when the backend has none)
    pub status: String,
    /// Local path for file-backed images
    pub path: String,
    /// Size in bytes (0 when unknown)
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// A VM known to a backend.
///
/// `status` is passed through verbatim from the backend; no shared state
/// enumeration is imposed across providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInstance {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Creation time as reported by the backend, already formatted
    pub created: String,
    pub private_ips: Vec<String>,
    pub public_ips: Vec<String>,
    pub image: String,
    pub ports: Vec<String>,
}

impl CloudInstance {
    /// First private address, or an empty string when there is none.
    pub fn primary_private_ip(&self) -> &str {
        self.private_ips.first().map(String::as_str).unwrap_or_default()
    }
}

/// An attachable block-storage unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NanosVolume {
    pub id: String,
    pub name: String,
    pub label: String,
    pub path: String,
    /// Human-readable size, e.g. `"1 MiB"`
    pub size: String,
    pub created_at: String,
    /// Instance the volume is attached to, if known
    pub attached_to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_private_ip_without_addresses() {
        let instance = CloudInstance {
            name: "web".to_string(),
            ..Default::default()
        };
        assert_eq!(instance.primary_private_ip(), "");
    }

    #[test]
    fn test_primary_private_ip_uses_first() {
        let instance = CloudInstance {
            private_ips: vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
            ..Default::default()
        };
        assert_eq!(instance.primary_private_ip(), "10.0.0.2");
    }
}
