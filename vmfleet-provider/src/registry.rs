//! Backend selection by name.

use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::bhyve::Bhyve;
use crate::config::ProviderConfig;
use crate::error::{ProviderError, Result};
use crate::local::LocalProvider;
use crate::openstack::OpenStack;
use crate::traits::Provider;
use crate::vbox::VirtualBoxProvider;

/// Registered backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Local,
    Bhyve,
    VirtualBox,
    OpenStack,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Local,
        ProviderKind::Bhyve,
        ProviderKind::VirtualBox,
        ProviderKind::OpenStack,
    ];

    /// Canonical registry key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => crate::local::BACKEND,
            ProviderKind::Bhyve => crate::bhyve::BACKEND,
            ProviderKind::VirtualBox => crate::vbox::BACKEND,
            ProviderKind::OpenStack => crate::openstack::BACKEND,
        }
    }

    /// Fresh, uninitialized driver of this kind.
    pub fn instantiate(&self) -> Result<Box<dyn Provider>> {
        Ok(match self {
            ProviderKind::Local => Box::new(LocalProvider::new()),
            ProviderKind::Bhyve => Box::new(Bhyve::new()),
            ProviderKind::VirtualBox => Box::new(VirtualBoxProvider::new()),
            ProviderKind::OpenStack => Box::new(OpenStack::new()?),
        })
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onprem" | "local" => Ok(ProviderKind::Local),
            "bhyve" => Ok(ProviderKind::Bhyve),
            "vbox" | "virtualbox" => Ok(ProviderKind::VirtualBox),
            "openstack" => Ok(ProviderKind::OpenStack),
            _ => Err(ProviderError::UnknownProvider(s.to_string())),
        }
    }
}

/// Instantiate and initialize the backend registered as `name`.
///
/// Every call returns a new driver; callers own it for one logical
/// operation and drop it afterwards.
pub async fn new_provider(name: &str, config: &ProviderConfig) -> Result<Box<dyn Provider>> {
    let kind: ProviderKind = name.parse()?;
    let mut provider = kind.instantiate()?;
    provider.initialize(config).await?;
    debug!(provider = %kind, "Provider initialized");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names_and_aliases() {
        assert_eq!("onprem".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!("local".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!(" VBox ".parse::<ProviderKind>().unwrap(), ProviderKind::VirtualBox);
        assert_eq!("bhyve".parse::<ProviderKind>().unwrap(), ProviderKind::Bhyve);
        assert_eq!("openstack".parse::<ProviderKind>().unwrap(), ProviderKind::OpenStack);
    }

    #[test]
    fn test_display_round_trips() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.to_string().parse::<ProviderKind>().unwrap(), kind);
        }
    }

    #[tokio::test]
    async fn test_unknown_provider_fails() {
        let err = new_provider("xen", &ProviderConfig::default()).await.err().unwrap();
        assert!(matches!(err, ProviderError::UnknownProvider(name) if name == "xen"));
    }

    #[tokio::test]
    async fn test_each_call_returns_fresh_driver() {
        let first = new_provider("onprem", &ProviderConfig::default()).await.unwrap();
        let second = new_provider("bhyve", &ProviderConfig::default()).await.unwrap();
        assert_eq!(first.name(), "onprem");
        assert_eq!(second.name(), "bhyve");
    }
}
