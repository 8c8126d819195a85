//! gRPC service implementation backed by a provider.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use vmfleet_proto::{
    Image, Images, ImagesResponse, Instance, Instances, InstancesResponse, ListRequest, Volume,
    Volumes, VolumesResponse,
};
use vmfleet_provider::{
    new_provider, CloudImage, CloudInstance, Config, Context, NanosVolume, Provider,
    ProviderConfig, ProviderError,
};

use crate::config::ProviderSettings;

/// Hands out a freshly initialized provider and context for every call.
#[async_trait]
pub trait ProviderSource: Send + Sync + 'static {
    /// Provider scoped to one request.
    async fn acquire(&self) -> Result<Box<dyn Provider>, ProviderError>;

    /// Context for one request.
    fn context(&self) -> Context;
}

/// [`ProviderSource`] backed by the provider registry.
pub struct RegistrySource {
    name: String,
    cloud: ProviderConfig,
    home: Option<PathBuf>,
}

impl RegistrySource {
    pub fn new(settings: &ProviderSettings) -> Self {
        Self {
            name: settings.name.clone(),
            cloud: settings.cloud.clone(),
            home: settings.home.clone(),
        }
    }
}

#[async_trait]
impl ProviderSource for RegistrySource {
    async fn acquire(&self) -> Result<Box<dyn Provider>, ProviderError> {
        new_provider(&self.name, &self.cloud).await
    }

    fn context(&self) -> Context {
        let mut config = match &self.home {
            Some(home) => Config::with_home(home),
            None => Config::default(),
        };
        config.cloud_config = self.cloud.clone();
        // Volume listings always read the local volume store.
        config.volumes_dir = Some(config.volumes_dir());
        Context::new(config)
    }
}

/// Map a provider error onto the closest gRPC status.
pub fn to_status(err: ProviderError) -> Status {
    match err {
        ProviderError::NotFound { .. } => Status::not_found(err.to_string()),
        ProviderError::Unsupported { .. } => Status::unimplemented(err.to_string()),
        ProviderError::InvalidConfig(_) | ProviderError::UnknownProvider(_) => {
            Status::invalid_argument(err.to_string())
        }
        ProviderError::Auth(_) => Status::unauthenticated(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn count(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

pub fn to_wire_instance(instance: &CloudInstance) -> Instance {
    Instance {
        name: instance.name.clone(),
        image: instance.image.clone(),
        pid: instance.id.clone(),
        status: instance.status.clone(),
        private_ip: instance.primary_private_ip().to_string(),
        created: instance.created.clone(),
    }
}

pub fn to_wire_image(image: &CloudImage) -> Image {
    Image {
        name: image.name.clone(),
        path: image.path.clone(),
        size: image.size,
        created: format_time(image.created_at),
    }
}

pub fn to_wire_volume(volume: &NanosVolume) -> Volume {
    Volume {
        name: volume.name.clone(),
        path: volume.path.clone(),
        size: volume.size.clone(),
        created: volume.created_at.clone(),
    }
}

/// Aggregation service: the same provider family behind all three services.
#[derive(Clone)]
pub struct AggregationService {
    source: Arc<dyn ProviderSource>,
}

impl AggregationService {
    pub fn new(source: Arc<dyn ProviderSource>) -> Self {
        Self { source }
    }

    async fn provider(&self) -> Result<Box<dyn Provider>, Status> {
        self.source.acquire().await.map_err(|e| {
            warn!(error = %e, "Failed to initialize provider");
            to_status(e)
        })
    }
}

#[tonic::async_trait]
impl Instances for AggregationService {
    #[instrument(skip(self, _request))]
    async fn get_instances(
        &self,
        _request: Request<ListRequest>,
    ) -> Result<Response<InstancesResponse>, Status> {
        let provider = self.provider().await?;
        let instances = provider
            .get_instances(&self.source.context())
            .await
            .map_err(to_status)?;
        debug!(count = instances.len(), "Listed instances");

        Ok(Response::new(InstancesResponse {
            count: count(instances.len()),
            instances: instances.iter().map(to_wire_instance).collect(),
        }))
    }
}

#[tonic::async_trait]
impl Images for AggregationService {
    #[instrument(skip(self, _request))]
    async fn get_images(
        &self,
        _request: Request<ListRequest>,
    ) -> Result<Response<ImagesResponse>, Status> {
        let provider = self.provider().await?;
        let images = provider
            .get_images(&self.source.context())
            .await
            .map_err(to_status)?;
        debug!(count = images.len(), "Listed images");

        Ok(Response::new(ImagesResponse {
            count: count(images.len()),
            images: images.iter().map(to_wire_image).collect(),
        }))
    }
}

#[tonic::async_trait]
impl Volumes for AggregationService {
    #[instrument(skip(self, _request))]
    async fn get_volumes(
        &self,
        _request: Request<ListRequest>,
    ) -> Result<Response<VolumesResponse>, Status> {
        let provider = self.provider().await?;
        let volumes = provider
            .get_all_volumes(&self.source.context())
            .await
            .map_err(to_status)?;
        debug!(count = volumes.len(), "Listed volumes");

        Ok(Response::new(VolumesResponse {
            count: count(volumes.len()),
            volumes: volumes.iter().map(to_wire_volume).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(provider: &str, home: &TempDir) -> AggregationService {
        let settings = ProviderSettings {
            name: provider.to_string(),
            home: Some(home.path().to_path_buf()),
            ..Default::default()
        };
        AggregationService::new(Arc::new(RegistrySource::new(&settings)))
    }

    #[tokio::test]
    async fn test_no_images_is_an_empty_response() {
        let home = TempDir::new().unwrap();
        let response = service("onprem", &home)
            .get_images(Request::new(ListRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.count, 0);
        assert!(response.images.is_empty());
    }

    #[tokio::test]
    async fn test_images_are_mapped() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(home.path().join("images")).unwrap();
        std::fs::write(home.path().join("images").join("web"), vec![0u8; 512]).unwrap();

        let response = service("onprem", &home)
            .get_images(Request::new(ListRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.count, 1);
        assert_eq!(response.images[0].name, "web");
        assert_eq!(response.images[0].size, 512);
        assert!(!response.images[0].created.is_empty());
    }

    #[tokio::test]
    async fn test_volumes_from_local_store() {
        let home = TempDir::new().unwrap();
        let volumes = home.path().join("volumes");
        std::fs::create_dir_all(&volumes).unwrap();
        std::fs::write(volumes.join("data:1234.raw"), vec![0u8; 1024 * 1024]).unwrap();

        let response = service("onprem", &home)
            .get_volumes(Request::new(ListRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.count, 1);
        assert_eq!(response.volumes[0].name, "data");
        assert_eq!(response.volumes[0].size, "1 MiB");
    }

    #[tokio::test]
    async fn test_unsupported_maps_to_unimplemented() {
        let home = TempDir::new().unwrap();
        let status = service("bhyve", &home)
            .get_volumes(Request::new(ListRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_invalid_argument() {
        let home = TempDir::new().unwrap();
        let status = service("xen", &home)
            .get_instances(Request::new(ListRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_instance_without_addresses_has_empty_private_ip() {
        let wire = to_wire_instance(&CloudInstance {
            id: "4242".to_string(),
            name: "web".to_string(),
            status: "Running".to_string(),
            ..Default::default()
        });
        assert_eq!(wire.pid, "4242");
        assert_eq!(wire.private_ip, "");
    }

    #[test]
    fn test_not_found_status() {
        let status = to_status(ProviderError::not_found("instance", "web"));
        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
