//! # vmfleet Provider
//!
//! One capability contract for images, instances and volumes across
//! unrelated virtualization backends:
//! - **onprem** - local QEMU processes managed through QMP
//! - **bhyve** - FreeBSD's hypervisor driven through its control utilities
//! - **vbox** - VirtualBox driven through `VBoxManage`
//! - **openstack** - Nova and Glance over REST
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vmfleet_provider::{new_provider, Config, Context, ProviderConfig};
//!
//! #[tokio::main]
//! async fn main() -> vmfleet_provider::Result<()> {
//!     let provider = new_provider("onprem", &ProviderConfig::default()).await?;
//!     let ctx = Context::new(Config::default());
//!
//!     for instance in provider.get_instances(&ctx).await? {
//!         println!("{} {}", instance.name, instance.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod bhyve;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod local;
pub mod openstack;
pub mod qmp;
pub mod registry;
pub mod render;
pub mod traits;
pub mod types;
pub mod units;
pub mod vbox;
pub mod volume;
pub mod wsl;

pub use builder::ExternalImageBuilder;
pub use config::{Config, ProviderConfig, RunConfig, Tag};
pub use context::Context;
pub use error::{ProviderError, Result};
pub use registry::{new_provider, ProviderKind};
pub use traits::{ImageBuilder, Provider};
pub use types::{CloudImage, CloudInstance, NanosVolume};
