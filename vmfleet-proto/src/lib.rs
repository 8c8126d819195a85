//! # vmfleet Proto
//!
//! Generated Rust code for the aggregation daemon's gRPC services.
//!
//! Three read-only services are defined, one per resource family:
//! `Instances`, `Images` and `Volumes`. Every message also derives
//! `serde` so the JSON gateway can return it unchanged.

// Include generated code
pub mod generated {
    pub mod vmfleet {
        pub mod v1 {
            include!("generated/vmfleet.v1.rs");
        }
    }
}

// Re-export for convenience
pub use generated::vmfleet::v1::*;
pub use generated::vmfleet::v1::images_client::ImagesClient;
pub use generated::vmfleet::v1::images_server::{Images, ImagesServer};
pub use generated::vmfleet::v1::instances_client::InstancesClient;
pub use generated::vmfleet::v1::instances_server::{Instances, InstancesServer};
pub use generated::vmfleet::v1::volumes_client::VolumesClient;
pub use generated::vmfleet::v1::volumes_server::{Volumes, VolumesServer};
