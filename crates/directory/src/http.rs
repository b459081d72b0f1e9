//! HTTP client for the remote directory: one handle per endpoint root,
//! bearer-token auth, schema catalog fetched at connect time.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, StatusCode};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use muster_schema::{plural, Schema};

use crate::{ClientSet, Collection, Directory, DirectoryError};

/// Connection settings shared by the three endpoint clients.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub url: String,
    pub token: String,
    pub cacert_pem: Option<String>,
    pub insecure_skip_tls: bool,
}

/// Wire shape of a directory error body.
#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub struct HttpDirectory {
    http: reqwest::Client,
    base: String,
    schemas: Arc<BTreeMap<String, Schema>>,
}

impl HttpDirectory {
    /// Connect to one endpoint root and fetch its schema catalog.
    pub async fn connect(opts: &ConnectOptions, base: &str) -> Result<Arc<Self>, DirectoryError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", opts.token))
            .map_err(|e| DirectoryError::Transport(format!("invalid token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder().default_headers(headers).use_rustls_tls();
        if let Some(pem) = &opts.cacert_pem {
            let cert = Certificate::from_pem(pem.as_bytes())
                .map_err(|e| DirectoryError::Transport(format!("reading ca certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if opts.insecure_skip_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(|e| DirectoryError::Transport(e.to_string()))?;

        let client = Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            schemas: Arc::new(BTreeMap::new()),
        };
        let schemas = client.fetch_schemas().await?;
        debug!(base = %client.base, kinds = schemas.len(), "schema catalog loaded");
        Ok(Arc::new(Self { schemas: Arc::new(schemas), ..client }))
    }

    async fn fetch_schemas(&self) -> Result<BTreeMap<String, Schema>, DirectoryError> {
        let url = format!("{}/schemas", self.base);
        let collection: Collection = self.request("schema", "", &url, None).await?;
        let mut schemas = BTreeMap::new();
        for raw in collection.data {
            let schema: Schema = serde_json::from_value(raw)
                .map_err(|e| DirectoryError::Decode(format!("schema document: {e}")))?;
            if !schema.id.is_empty() {
                schemas.insert(schema.id.clone(), schema);
            }
        }
        Ok(schemas)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        target: &str,
        url: &str,
        body: Option<&Json>,
    ) -> Result<T, DirectoryError> {
        let request = match body {
            Some(b) => self.http.post(url).json(b),
            None => self.http.get(url),
        };
        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(format!("{url}: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DirectoryError::Transport(format!("{url}: {e}")))?;
        if !status.is_success() {
            return Err(classify(kind, target, status, &bytes));
        }
        serde_json::from_slice(&bytes).map_err(|e| DirectoryError::Decode(format!("{url}: {e}")))
    }
}

/// Map a failed response onto the error taxonomy. Duplicate-name rejections
/// surface as `Conflict` whether reported by status or by wire error code.
fn classify(kind: &str, target: &str, status: StatusCode, body: &[u8]) -> DirectoryError {
    let api: ApiError = serde_json::from_slice(body).unwrap_or_default();
    let message = if api.message.is_empty() { status.to_string() } else { api.message };
    if status == StatusCode::CONFLICT || api.code == "NotUnique" || api.code == "Conflict" {
        return DirectoryError::Conflict { kind: kind.to_string(), message };
    }
    if status == StatusCode::NOT_FOUND {
        return DirectoryError::NotFound { kind: kind.to_string(), id: target.to_string() };
    }
    DirectoryError::Transport(format!("{kind}: {status}: {message}"))
}

fn scoped_base(base: &str, segment: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), segment)
}

#[async_trait]
impl Directory for HttpDirectory {
    fn has_kind(&self, kind: &str) -> bool {
        self.schemas.contains_key(kind)
    }

    fn schemas(&self) -> &BTreeMap<String, Schema> {
        &self.schemas
    }

    async fn list(&self, kind: &str) -> Result<Collection, DirectoryError> {
        let url = format!("{}/{}", self.base, plural(kind));
        self.request(kind, "", &url, None).await
    }

    async fn create(&self, kind: &str, body: &Json) -> Result<Json, DirectoryError> {
        let url = format!("{}/{}", self.base, plural(kind));
        self.request(kind, "", &url, Some(body)).await
    }

    async fn get_by_id(&self, kind: &str, id: &str) -> Result<Json, DirectoryError> {
        let url = format!("{}/{}/{}", self.base, plural(kind), id);
        self.request(kind, id, &url, None).await
    }

    fn scoped(&self, segment: &str) -> Arc<dyn Directory> {
        Arc::new(Self {
            http: self.http.clone(),
            base: scoped_base(&self.base, segment),
            schemas: self.schemas.clone(),
        })
    }
}

impl ClientSet {
    /// Connect the management, cluster-root, and project-root endpoints from
    /// one set of options.
    pub async fn connect(opts: &ConnectOptions) -> Result<Self, DirectoryError> {
        let root = opts.url.trim_end_matches('/');
        let management = HttpDirectory::connect(opts, root).await?;
        let cluster = HttpDirectory::connect(opts, &format!("{root}/clusters")).await?;
        let project = HttpDirectory::connect(opts, &format!("{root}/projects")).await?;
        Ok(Self { management, cluster, project })
    }
}
