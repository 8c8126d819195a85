//! Keystone v3 authentication and a thin JSON client for Nova and Glance.

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{ProviderError, Result};

/// Timeout for ordinary API calls. Image uploads are not bounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials resolved from the `OS_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_id: String,
    pub project_name: String,
    pub user_domain: String,
    pub project_domain: String,
    pub region: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve credentials through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let required = |key: &str| {
            let value = get(key);
            if value.is_empty() {
                Err(ProviderError::Auth(format!("{} is not set", key)))
            } else {
                Ok(value)
            }
        };

        let project_name = match get("OS_PROJECT_NAME") {
            name if name.is_empty() => get("OS_TENANT_NAME"),
            name => name,
        };
        let user_domain = match get("OS_USER_DOMAIN_NAME") {
            domain if domain.is_empty() => "Default".to_string(),
            domain => domain,
        };
        let project_domain = match get("OS_PROJECT_DOMAIN_NAME") {
            domain if domain.is_empty() => user_domain.clone(),
            domain => domain,
        };

        Ok(Self {
            auth_url: required("OS_AUTH_URL")?,
            username: required("OS_USERNAME")?,
            password: required("OS_PASSWORD")?,
            project_id: get("OS_PROJECT_ID"),
            project_name,
            user_domain,
            project_domain,
            region: get("OS_REGION_NAME"),
        })
    }

    fn auth_body(&self) -> Value {
        let project = if self.project_id.is_empty() {
            json!({
                "name": self.project_name,
                "domain": { "name": self.project_domain },
            })
        } else {
            json!({ "id": self.project_id })
        };

        let mut body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "password": self.password,
                            "domain": { "name": self.user_domain },
                        }
                    }
                }
            }
        });
        if !self.project_id.is_empty() || !self.project_name.is_empty() {
            body["auth"]["scope"] = json!({ "project": project });
        }
        body
    }
}

/// Authenticated token plus the service endpoints it was issued for.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    /// Nova endpoint, including version and project
    pub compute_url: String,
    /// Glance endpoint root, without the `/v2` suffix
    pub image_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    region_id: String,
    url: String,
}

fn endpoint(catalog: &[CatalogEntry], kind: &str, region: &str) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.kind == kind)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && (region.is_empty() || ep.region == region || ep.region_id == region)
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| ProviderError::Auth(format!("no public {} endpoint in service catalog", kind)))
}

/// Build the HTTP client shared by all calls of one provider.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| ProviderError::api("http", e.to_string()))
}

/// Exchange `credentials` for a token and resolve the Nova and Glance endpoints.
#[instrument(skip(http, credentials), fields(auth_url = %credentials.auth_url, user = %credentials.username))]
pub async fn authenticate(http: &Client, credentials: &Credentials) -> Result<Session> {
    let url = format!("{}/auth/tokens", credentials.auth_url.trim_end_matches('/'));
    let resp = http
        .post(&url)
        .timeout(REQUEST_TIMEOUT)
        .json(&credentials.auth_body())
        .send()
        .await
        .map_err(|e| ProviderError::Auth(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Auth(format!("{} - {}", status, text)));
    }

    let token = resp
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Auth("response carries no X-Subject-Token".to_string()))?;
    let body: TokenResponse = resp
        .json()
        .await
        .map_err(|e| ProviderError::api("keystone", e.to_string()))?;

    let session = Session {
        token,
        compute_url: endpoint(&body.token.catalog, "compute", &credentials.region)?,
        image_url: endpoint(&body.token.catalog, "image", &credentials.region)?,
    };
    info!(compute = %session.compute_url, image = %session.image_url, "Authenticated");
    Ok(session)
}

/// JSON calls against one service, carrying the session token.
pub(crate) struct Service<'a> {
    pub http: &'a Client,
    pub token: &'a str,
    pub base: &'a str,
    pub name: &'static str,
}

impl Service<'_> {
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base, path)
        }
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("X-Auth-Token", self.token)
    }

    /// Send with the API timeout and turn non-success statuses into errors.
    pub async fn send(&self, req: RequestBuilder) -> Result<Response> {
        self.send_unbounded(req.timeout(REQUEST_TIMEOUT)).await
    }

    pub async fn send_unbounded(&self, req: RequestBuilder) -> Result<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::api(self.name, e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        debug!(service = self.name, %status, body = %text, "Request rejected");
        Err(match status {
            StatusCode::UNAUTHORIZED => ProviderError::Auth(text),
            _ => ProviderError::api(self.name, format!("{} - {}", status, text)),
        })
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        self.decode(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Response> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)).await.map(|_| ())
    }

    pub async fn decode(&self, resp: Response) -> Result<Value> {
        resp.json()
            .await
            .map_err(|e| ProviderError::api(self.name, format!("invalid response body: {}", e)))
    }
}
