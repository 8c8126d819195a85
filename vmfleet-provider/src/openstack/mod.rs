//! OpenStack backend over the Keystone, Nova and Glance REST APIs.
//!
//! Everything this backend creates carries the `CreatedBy` ownership marker
//! (an image tag, a server metadata key) and every listing filters on it, so
//! resources made by other tools stay invisible.

mod client;

pub use client::{authenticate, http_client, Credentials, Session};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument};

use crate::builder::ExternalImageBuilder;
use crate::config::{Config, ProviderConfig};
use crate::context::Context;
use crate::error::{ProviderError, Result};
use crate::traits::{ImageBuilder, Provider};
use crate::types::*;
use client::Service;

pub const BACKEND: &str = "openstack";

pub const OWNER_KEY: &str = "CreatedBy";
pub const OWNER_VALUE: &str = "vmfleet";

const UPLOAD_CHUNK: usize = 1024 * 1024;
const CONSOLE_LINES: u32 = 100;
const PUBLIC_POOLS: [&str; 2] = ["public", "Ext-Net"];

/// Tag attached to every image this backend uploads.
pub fn owner_tag() -> String {
    format!("{}:{}", OWNER_KEY, OWNER_VALUE)
}

/// Cloud image name for a locally built image.
fn cloud_image_name(name: &str) -> String {
    name.replace("-image", "")
}

/// OpenStack provider.
pub struct OpenStack {
    http: Client,
    session: Option<Session>,
    builder: Arc<dyn ImageBuilder>,
}

impl OpenStack {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            session: None,
            builder: Arc::new(ExternalImageBuilder::default()),
        })
    }

    /// Provider bound to an existing session, skipping Keystone.
    pub fn with_session(session: Session, builder: Arc<dyn ImageBuilder>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            session: Some(session),
            builder,
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ProviderError::Auth("provider is not initialized".to_string()))
    }

    fn glance(&self) -> Result<Service<'_>> {
        let session = self.session()?;
        Ok(Service {
            http: &self.http,
            token: &session.token,
            base: &session.image_url,
            name: "glance",
        })
    }

    fn nova(&self) -> Result<Service<'_>> {
        let session = self.session()?;
        Ok(Service {
            http: &self.http,
            token: &session.token,
            base: &session.compute_url,
            name: "nova",
        })
    }

    /// All Glance images matching `query`, following `next` links.
    async fn list_images(&self, query: &[(&str, &str)]) -> Result<Vec<Value>> {
        let glance = self.glance()?;
        let mut images = Vec::new();

        let mut resp = glance
            .send(glance.request(Method::GET, "/v2/images").query(query))
            .await?;
        loop {
            let page = glance.decode(resp).await?;
            if let Some(items) = page["images"].as_array() {
                images.extend(items.iter().cloned());
            }
            let Some(next) = page["next"].as_str().filter(|n| !n.is_empty()) else {
                break;
            };
            resp = glance.send(glance.request(Method::GET, next)).await?;
        }
        Ok(images)
    }

    /// Id of the first image named `name` in listing order.
    pub async fn find_image(&self, name: &str) -> Result<String> {
        self.list_images(&[("name", name)])
            .await?
            .iter()
            .find_map(|image| image["id"].as_str().map(str::to_string))
            .ok_or_else(|| ProviderError::not_found("image", name))
    }

    /// Id of the first public flavor named `name`, or the first flavor when
    /// `name` is empty.
    pub async fn find_flavor(&self, name: &str) -> Result<String> {
        let flavors = self.nova()?.get("/flavors/detail?is_public=true").await?;
        flavors["flavors"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|flavor| name.is_empty() || flavor["name"].as_str() == Some(name))
            .and_then(|flavor| flavor["id"].as_str().map(str::to_string))
            .ok_or_else(|| ProviderError::not_found("flavor", if name.is_empty() { "<any>" } else { name }))
    }

    /// Servers carrying the ownership metadata.
    async fn owned_servers(&self) -> Result<Vec<Value>> {
        let servers = self.nova()?.get("/servers/detail").await?;
        Ok(servers["servers"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|server| server["metadata"][OWNER_KEY].as_str() == Some(OWNER_VALUE))
            .cloned()
            .collect())
    }

    async fn server_id(&self, ctx: &Context, name: &str) -> Result<String> {
        Ok(self.get_instance_by_name(ctx, name).await?.id)
    }

    async fn server_action(&self, ctx: &Context, name: &str, action: Value) -> Result<reqwest::Response> {
        let id = self.server_id(ctx, name).await?;
        self.nova()?
            .post(&format!("/servers/{}/action", id), &action)
            .await
    }

    /// Stream `path` into the data endpoint of image `id`.
    async fn upload(&self, id: &str, path: &Path) -> Result<()> {
        let glance = self.glance()?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ProviderError::io(path, e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| ProviderError::io(path, e))?
            .len();

        let chunks = futures::stream::unfold(file, |mut file| async move {
            let mut buf = vec![0u8; UPLOAD_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok::<_, std::io::Error>(Bytes::from(buf)), file))
                }
                Err(e) => Some((Err(e), file)),
            }
        });

        let req = glance
            .request(Method::PUT, &format!("/v2/images/{}/file", id))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(chunks));

        vmfleet_common::Spinner::wrap("uploading image", glance.send_unbounded(req)).await??;
        Ok(())
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn to_image(image: &Value) -> CloudImage {
    CloudImage {
        id: image["id"].as_str().unwrap_or_default().to_string(),
        name: image["name"].as_str().unwrap_or_default().to_string(),
        status: image["status"].as_str().unwrap_or_default().to_string(),
        path: String::new(),
        size: image["size"].as_i64().unwrap_or_default(),
        created_at: parse_time(&image["created_at"]),
    }
}

/// IPv4 addresses of `server`, split into (private, public) by pool name.
fn addresses(server: &Value) -> (Vec<String>, Vec<String>) {
    let mut private = Vec::new();
    let mut public = Vec::new();

    if let Some(pools) = server["addresses"].as_object() {
        for (pool, entries) in pools {
            for entry in entries.as_array().into_iter().flatten() {
                if entry["version"].as_i64() != Some(4) {
                    continue;
                }
                let Some(addr) = entry["addr"].as_str() else {
                    continue;
                };
                if PUBLIC_POOLS.contains(&pool.as_str()) {
                    public.push(addr.to_string());
                } else {
                    private.push(addr.to_string());
                }
            }
        }
    }
    (private, public)
}

fn to_instance(server: &Value) -> CloudInstance {
    let (private_ips, public_ips) = addresses(server);
    CloudInstance {
        id: server["id"].as_str().unwrap_or_default().to_string(),
        name: server["name"].as_str().unwrap_or_default().to_string(),
        status: server["status"].as_str().unwrap_or_default().to_string(),
        created: parse_time(&server["created"])
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default(),
        private_ips,
        public_ips,
        image: server["metadata"]["Image"].as_str().unwrap_or_default().to_string(),
        ports: Vec::new(),
    }
}

#[async_trait]
impl Provider for OpenStack {
    fn name(&self) -> &'static str {
        BACKEND
    }

    /// Authenticate once with the `OS_*` credentials from the environment.
    async fn initialize(&mut self, _config: &ProviderConfig) -> Result<()> {
        let credentials = Credentials::from_env()?;
        self.session = Some(authenticate(&self.http, &credentials).await?);
        Ok(())
    }

    // =========================================================================
    // Images
    // =========================================================================

    async fn build_image(&self, ctx: &Context) -> Result<PathBuf> {
        self.builder.build_image(ctx.config()).await?;
        self.customize_image(ctx).await
    }

    async fn build_image_with_package(&self, ctx: &Context, package: &Path) -> Result<PathBuf> {
        self.builder
            .build_image_from_package(package, ctx.config())
            .await?;
        self.customize_image(ctx).await
    }

    /// Register a private raw image owned by this backend and upload `image_path`.
    #[instrument(skip(self, ctx), fields(image = %ctx.config().cloud_config.image_name))]
    async fn create_image(&self, ctx: &Context, image_path: &Path) -> Result<()> {
        let name = cloud_image_name(&ctx.config().cloud_config.image_name);
        info!(name = %name, "Creating image");

        let glance = self.glance()?;
        let resp = glance
            .post(
                "/v2/images",
                &json!({
                    "name": name,
                    "disk_format": "raw",
                    "container_format": "bare",
                    "visibility": "private",
                    "tags": [owner_tag()],
                }),
            )
            .await?;
        let image = glance.decode(resp).await?;
        let id = image["id"]
            .as_str()
            .ok_or_else(|| ProviderError::api("glance", "created image has no id"))?
            .to_string();

        self.upload(&id, image_path).await?;
        info!(id = %id, "Image uploaded");
        Ok(())
    }

    async fn get_images(&self, _ctx: &Context) -> Result<Vec<CloudImage>> {
        let tag = owner_tag();
        Ok(self
            .list_images(&[("tag", tag.as_str())])
            .await?
            .iter()
            .map(to_image)
            .collect())
    }

    #[instrument(skip(self, _ctx))]
    async fn delete_image(&self, _ctx: &Context, name: &str) -> Result<()> {
        let id = self.find_image(name).await?;
        self.glance()?.delete(&format!("/v2/images/{}", id)).await?;
        info!(id = %id, "Image deleted");
        Ok(())
    }

    async fn resize_image(&self, _ctx: &Context, _name: &str, _size: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "resize image"))
    }

    async fn sync_image(&self, _config: &Config, _target: &dyn Provider, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "sync image"))
    }

    async fn customize_image(&self, ctx: &Context) -> Result<PathBuf> {
        Ok(ctx.config().image_path())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// Boot a server from a volume cloned off the configured image.
    #[instrument(skip(self, ctx), fields(image = %ctx.config().cloud_config.image_name))]
    async fn create_instance(&self, ctx: &Context) -> Result<()> {
        let config = ctx.config();
        let image_name = &config.cloud_config.image_name;
        let image_id = self.find_image(image_name).await?;
        let flavor_id = self.find_flavor(&config.cloud_config.flavor).await?;
        let name = config.instance_name();

        let body = json!({
            "server": {
                "name": name,
                "flavorRef": flavor_id,
                "metadata": {
                    OWNER_KEY: OWNER_VALUE,
                    "Image": image_name,
                },
                "block_device_mapping_v2": [{
                    "boot_index": 0,
                    "uuid": image_id,
                    "source_type": "image",
                    "destination_type": "volume",
                    "volume_size": config.run_config.volume_size_gb,
                    "delete_on_termination": true,
                }],
            }
        });

        let nova = self.nova()?;
        let resp = nova.post("/servers", &body).await?;
        let created = nova.decode(resp).await?;
        info!(
            instance = %name,
            id = created["server"]["id"].as_str().unwrap_or_default(),
            "Instance created"
        );
        Ok(())
    }

    async fn get_instances(&self, _ctx: &Context) -> Result<Vec<CloudInstance>> {
        Ok(self.owned_servers().await?.iter().map(to_instance).collect())
    }

    #[instrument(skip(self, ctx))]
    async fn delete_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        let id = self.server_id(ctx, name).await?;
        self.nova()?.delete(&format!("/servers/{}", id)).await?;
        info!(id = %id, "Instance deleted");
        Ok(())
    }

    async fn start_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.server_action(ctx, name, json!({ "os-start": null })).await?;
        Ok(())
    }

    async fn stop_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.server_action(ctx, name, json!({ "os-stop": null })).await?;
        Ok(())
    }

    async fn reset_instance(&self, ctx: &Context, name: &str) -> Result<()> {
        self.server_action(ctx, name, json!({ "reboot": { "type": "HARD" } }))
            .await?;
        Ok(())
    }

    async fn get_instance_logs(&self, ctx: &Context, name: &str) -> Result<String> {
        let resp = self
            .server_action(
                ctx,
                name,
                json!({ "os-getConsoleOutput": { "length": CONSOLE_LINES } }),
            )
            .await?;
        let body = self.nova()?.decode(resp).await?;
        Ok(body["output"].as_str().unwrap_or_default().to_string())
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn create_volume(
        &self,
        _ctx: &Context,
        _name: &str,
        _data: Option<&Path>,
        _size: &str,
        _provider: &str,
    ) -> Result<NanosVolume> {
        Err(ProviderError::unsupported(BACKEND, "create volume"))
    }

    async fn get_all_volumes(&self, _ctx: &Context) -> Result<Vec<NanosVolume>> {
        Err(ProviderError::unsupported(BACKEND, "list volumes"))
    }

    async fn delete_volume(&self, _ctx: &Context, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "delete volume"))
    }

    async fn attach_volume(
        &self,
        _ctx: &Context,
        _instance: &str,
        _name: &str,
        _attach_slot: Option<u32>,
    ) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "attach volume"))
    }

    async fn detach_volume(&self, _ctx: &Context, _instance: &str, _name: &str) -> Result<()> {
        Err(ProviderError::unsupported(BACKEND, "detach volume"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::testing::StubBuilder;
    use axum::body::Bytes as Body;
    use axum::extract::{Path as UrlPath, Query, State};
    use axum::routing::{delete, get, post, put};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Cloud {
        requests: Mutex<Vec<(String, Value)>>,
        uploaded: Mutex<usize>,
    }

    impl Cloud {
        fn record(&self, what: impl Into<String>, body: Value) {
            self.requests.lock().unwrap().push((what.into(), body));
        }

        fn requests(&self) -> Vec<(String, Value)> {
            self.requests.lock().unwrap().clone()
        }
    }

    async fn images(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        if q.get("marker").map(String::as_str) == Some("a") {
            return Json(json!({ "images": [
                { "id": "img-b", "name": "api", "status": "queued", "size": null }
            ]}));
        }
        match (q.get("name").map(String::as_str), q.get("tag").map(String::as_str)) {
            (Some("dup"), _) => Json(json!({ "images": [
                { "id": "first", "name": "dup" },
                { "id": "second", "name": "dup" },
            ]})),
            (Some("web"), _) => Json(json!({ "images": [{ "id": "img-web", "name": "web" }] })),
            (None, Some("CreatedBy:vmfleet")) => Json(json!({
                "images": [{
                    "id": "img-a",
                    "name": "web",
                    "status": "active",
                    "size": 4096,
                    "created_at": "2024-03-01T10:00:00Z",
                }],
                "next": "/v2/images?tag=CreatedBy:vmfleet&marker=a",
            })),
            _ => Json(json!({ "images": [] })),
        }
    }

    async fn create_image(State(cloud): State<Arc<Cloud>>, Json(body): Json<Value>) -> Json<Value> {
        cloud.record("create image", body);
        Json(json!({ "id": "img-new" }))
    }

    async fn upload(
        State(cloud): State<Arc<Cloud>>,
        UrlPath(id): UrlPath<String>,
        body: Body,
    ) -> axum::http::StatusCode {
        cloud.record(format!("upload {}", id), Value::Null);
        *cloud.uploaded.lock().unwrap() = body.len();
        axum::http::StatusCode::NO_CONTENT
    }

    async fn delete_image(State(cloud): State<Arc<Cloud>>, UrlPath(id): UrlPath<String>) -> axum::http::StatusCode {
        cloud.record(format!("delete image {}", id), Value::Null);
        axum::http::StatusCode::NO_CONTENT
    }

    async fn flavors() -> Json<Value> {
        Json(json!({ "flavors": [
            { "id": "f-small", "name": "small" },
            { "id": "f-large", "name": "large" },
            { "id": "f-large-2", "name": "large" },
        ]}))
    }

    async fn servers() -> Json<Value> {
        Json(json!({ "servers": [
            {
                "id": "srv-1",
                "name": "web",
                "status": "ACTIVE",
                "created": "2024-03-01T10:00:00Z",
                "metadata": { "CreatedBy": "vmfleet", "Image": "web" },
                "addresses": {
                    "Ext-Net": [
                        { "addr": "2001:db8::1", "version": 6 },
                        { "addr": "203.0.113.7", "version": 4 },
                    ],
                    "private": [{ "addr": "10.0.0.5", "version": 4 }],
                },
            },
            {
                "id": "srv-2",
                "name": "other",
                "status": "ACTIVE",
                "metadata": {},
                "addresses": {},
            },
        ]}))
    }

    async fn create_server(State(cloud): State<Arc<Cloud>>, Json(body): Json<Value>) -> Json<Value> {
        cloud.record("create server", body);
        Json(json!({ "server": { "id": "srv-new" } }))
    }

    async fn action(
        State(cloud): State<Arc<Cloud>>,
        UrlPath(id): UrlPath<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        cloud.record(format!("action {}", id), body);
        Json(json!({ "output": "login:" }))
    }

    async fn delete_server(State(cloud): State<Arc<Cloud>>, UrlPath(id): UrlPath<String>) -> axum::http::StatusCode {
        cloud.record(format!("delete server {}", id), Value::Null);
        axum::http::StatusCode::NO_CONTENT
    }

    async fn setup() -> (Arc<Cloud>, OpenStack, Context) {
        let cloud = Arc::new(Cloud::default());
        let app = Router::new()
            .route("/image/v2/images", get(images).post(create_image))
            .route("/image/v2/images/:id", delete(delete_image))
            .route("/image/v2/images/:id/file", put(upload))
            .route("/compute/flavors/detail", get(flavors))
            .route("/compute/servers/detail", get(servers))
            .route("/compute/servers", post(create_server))
            .route("/compute/servers/:id", delete(delete_server))
            .route("/compute/servers/:id/action", post(action))
            .with_state(cloud.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let session = Session {
            token: "tok".to_string(),
            compute_url: format!("http://{}/compute", addr),
            image_url: format!("http://{}/image", addr),
        };
        let provider = OpenStack::with_session(session, Arc::new(StubBuilder::default())).unwrap();

        let mut config = Config::default();
        config.cloud_config.image_name = "web".to_string();
        (cloud, provider, Context::new(config))
    }

    #[tokio::test]
    async fn test_find_image_picks_first_duplicate() {
        let (_cloud, provider, _ctx) = setup().await;
        assert_eq!(provider.find_image("dup").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn test_find_image_without_match_is_not_found() {
        let (_cloud, provider, _ctx) = setup().await;
        assert!(provider.find_image("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_flavor() {
        let (_cloud, provider, _ctx) = setup().await;
        assert_eq!(provider.find_flavor("").await.unwrap(), "f-small");
        assert_eq!(provider.find_flavor("large").await.unwrap(), "f-large");
        assert!(provider.find_flavor("huge").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_get_images_follows_pagination() {
        let (_cloud, provider, ctx) = setup().await;

        let images = provider.get_images(&ctx).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].id, "img-a");
        assert_eq!(images[0].size, 4096);
        assert!(images[0].created_at.is_some());
        assert_eq!(images[1].name, "api");
        assert_eq!(images[1].size, 0);
    }

    #[tokio::test]
    async fn test_create_image_registers_and_uploads() {
        let (cloud, provider, mut ctx) = setup().await;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("web-image.img");
        tokio::fs::write(&path, vec![7u8; UPLOAD_CHUNK + 10]).await.unwrap();

        let mut config = ctx.config().clone();
        config.cloud_config.image_name = "web-image".to_string();
        ctx = Context::new(config);
        provider.create_image(&ctx, &path).await.unwrap();

        let requests = cloud.requests();
        assert_eq!(requests[0].0, "create image");
        assert_eq!(requests[0].1["name"], "web");
        assert_eq!(requests[0].1["disk_format"], "raw");
        assert_eq!(requests[0].1["visibility"], "private");
        assert_eq!(requests[0].1["tags"], json!(["CreatedBy:vmfleet"]));
        assert_eq!(requests[1].0, "upload img-new");
        assert_eq!(*cloud.uploaded.lock().unwrap(), UPLOAD_CHUNK + 10);
    }

    #[tokio::test]
    async fn test_delete_image_by_name() {
        let (cloud, provider, ctx) = setup().await;
        provider.delete_image(&ctx, "web").await.unwrap();
        assert_eq!(cloud.requests()[0].0, "delete image img-web");
    }

    #[tokio::test]
    async fn test_instances_are_filtered_by_owner() {
        let (_cloud, provider, ctx) = setup().await;

        let instances = provider.get_instances(&ctx).await.unwrap();
        assert_eq!(instances.len(), 1);
        let web = &instances[0];
        assert_eq!(web.id, "srv-1");
        assert_eq!(web.status, "ACTIVE");
        assert_eq!(web.image, "web");
        assert_eq!(web.public_ips, vec!["203.0.113.7".to_string()]);
        assert_eq!(web.private_ips, vec!["10.0.0.5".to_string()]);
        assert!(!web.created.is_empty());

        assert!(provider
            .get_instance_by_name(&ctx, "other")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_create_instance_boots_from_volume() {
        let (cloud, provider, mut ctx) = setup().await;
        let mut config = ctx.config().clone();
        config.cloud_config.flavor = "large".to_string();
        config.run_config.instance_name = "web-1".to_string();
        config.run_config.volume_size_gb = 4;
        ctx = Context::new(config);

        provider.create_instance(&ctx).await.unwrap();

        let requests = cloud.requests();
        let (what, body) = &requests[0];
        assert_eq!(what, "create server");
        let server = &body["server"];
        assert_eq!(server["name"], "web-1");
        assert_eq!(server["flavorRef"], "f-large");
        assert_eq!(server["metadata"]["CreatedBy"], "vmfleet");
        assert_eq!(server["block_device_mapping_v2"][0]["uuid"], "img-web");
        assert_eq!(server["block_device_mapping_v2"][0]["volume_size"], 4);
    }

    #[tokio::test]
    async fn test_lifecycle_actions() {
        let (cloud, provider, ctx) = setup().await;

        provider.stop_instance(&ctx, "web").await.unwrap();
        provider.reset_instance(&ctx, "web").await.unwrap();
        assert_eq!(provider.get_instance_logs(&ctx, "web").await.unwrap(), "login:");
        provider.delete_instance(&ctx, "web").await.unwrap();

        let requests = cloud.requests();
        assert_eq!(requests[0], ("action srv-1".to_string(), json!({ "os-stop": null })));
        assert_eq!(requests[1].1, json!({ "reboot": { "type": "HARD" } }));
        assert_eq!(requests[2].1["os-getConsoleOutput"]["length"], 100);
        assert_eq!(requests[3].0, "delete server srv-1");
    }

    #[tokio::test]
    async fn test_volumes_and_resize_are_unsupported() {
        let (cloud, provider, ctx) = setup().await;

        assert!(provider.get_all_volumes(&ctx).await.unwrap_err().is_unsupported());
        assert!(provider
            .create_volume(&ctx, "data", None, "1G", BACKEND)
            .await
            .unwrap_err()
            .is_unsupported());
        assert!(provider
            .resize_image(&ctx, "web", "2G")
            .await
            .unwrap_err()
            .is_unsupported());
        assert!(cloud.requests().is_empty());
    }

    #[tokio::test]
    async fn test_uninitialized_provider_reports_auth() {
        let provider = OpenStack::new().unwrap();
        let err = provider.get_images(&Context::new(Config::default())).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }
}
