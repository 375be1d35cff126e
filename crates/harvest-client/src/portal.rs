use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_core::egress::EgressIdentity;
use harvest_core::error::HarvestError;
use harvest_core::models::{Page, PageRequest, RawRecord, Region, Session};
use harvest_core::traits::PortalAdapter;
use reqwest::{Client, Proxy, Response};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("permit-harvest/", env!("CARGO_PKG_VERSION"));

/// Portal adapter for a JSON search API:
///
/// - `POST {base}/auth` with `{username, password}` returns `{token}`
/// - `GET {base}/regions` returns `[{id, categories}]`
/// - `GET {base}/search?region=&category=&prefix=&offset=&limit=` returns
///   `{records, total}`
///
/// One reqwest client is built per egress identity and pool generation, so
/// every proxy keeps its own connection pool and a pool rotation starts
/// fresh connections.
#[derive(Clone)]
pub struct HttpPortal {
    base_url: Url,
    username: String,
    password: String,
    timeout: Duration,
    clients: Arc<Mutex<HashMap<String, (u64, Client)>>>,
}

impl HttpPortal {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, HarvestError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| HarvestError::Config(format!("Invalid portal URL '{base_url}': {e}")))?;
        match base_url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(HarvestError::Config(format!(
                    "portal URL scheme '{scheme}' is not allowed (only http/https)"
                )));
            }
        }
        // Make relative joins append to the path instead of replacing its
        // last segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            username: username.into(),
            password: password.into(),
            timeout: DEFAULT_TIMEOUT,
            clients: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, HarvestError> {
        self.base_url
            .join(path)
            .map_err(|e| HarvestError::Config(format!("Invalid endpoint '{path}': {e}")))
    }

    /// Client for `identity`, built on first use and rebuilt after the pool
    /// generation moves on.
    fn client_for(&self, identity: &EgressIdentity) -> Result<Client, HarvestError> {
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned client cache mutex");
            poisoned.into_inner()
        });
        let label = identity.label();
        if let Some((generation, client)) = clients.get(label) {
            if *generation == identity.generation {
                return Ok(client.clone());
            }
        }

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(self.timeout);
        if let Some(address) = &identity.address {
            let mut proxy = Proxy::all(address.as_str())
                .map_err(|e| HarvestError::Config(format!("Invalid proxy '{address}': {e}")))?;
            if let Some(credentials) = &identity.credentials {
                proxy = proxy.basic_auth(&credentials.username, &credentials.password);
            }
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {e}")))?;

        tracing::debug!(
            identity = %label,
            generation = identity.generation,
            "Built HTTP client for egress identity"
        );
        clients.insert(label.to_string(), (identity.generation, client.clone()));
        Ok(client)
    }

    fn send_error(&self, e: reqwest::Error) -> HarvestError {
        if e.is_timeout() {
            HarvestError::Timeout(self.timeout.as_secs())
        } else if e.is_connect() {
            HarvestError::Transport(format!("Connection failed: {e}"))
        } else {
            HarvestError::Transport(e.to_string())
        }
    }

    /// Pass successful responses through; map everything else onto the
    /// error taxonomy, keeping the body as the message.
    async fn check(&self, response: Response) -> Result<Response, HarvestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HarvestError::from_status(
            status.as_u16(),
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)),
        ))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, HarvestError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| self.send_error(e))?;
        serde_json::from_slice(&bytes).map_err(|e| HarvestError::Http {
            status,
            message: format!("Unexpected response body: {e}"),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---- Portal API types ----

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    records: Vec<RawRecord>,
    #[serde(default)]
    total: Option<u64>,
}

impl PortalAdapter for HttpPortal {
    async fn authenticate(&self, identity: &EgressIdentity) -> Result<Session, HarvestError> {
        let client = self.client_for(identity)?;
        let response = client
            .post(self.endpoint("auth")?)
            .json(&AuthRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(HarvestError::AuthFailed(format!(
                "portal rejected credentials for '{}' (HTTP {status})",
                self.username
            )));
        }
        let response = self.check(response).await?;
        let auth: AuthResponse = self.decode(response).await?;
        tracing::info!(identity = %identity.label(), "Authenticated with portal");
        Ok(Session { token: auth.token })
    }

    async fn enumerate_regions(
        &self,
        session: &Session,
        identity: &EgressIdentity,
    ) -> Result<Vec<Region>, HarvestError> {
        let client = self.client_for(identity)?;
        let response = client
            .get(self.endpoint("regions")?)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = self.check(response).await?;
        self.decode(response).await
    }

    async fn fetch_page(
        &self,
        session: &Session,
        identity: &EgressIdentity,
        request: &PageRequest,
    ) -> Result<Page, HarvestError> {
        let client = self.client_for(identity)?;
        let partition = &request.partition;

        let mut query: Vec<(&str, String)> = vec![
            ("region", partition.region.clone()),
            ("category", partition.category.clone()),
        ];
        if let Some(prefix) = &partition.prefix {
            query.push(("prefix", prefix.clone()));
        }
        query.push(("offset", request.offset.to_string()));
        query.push(("limit", request.page_size.to_string()));

        let response = client
            .get(self.endpoint("search")?)
            .bearer_auth(&session.token)
            .query(&query)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let response = self.check(response).await?;
        let body: SearchResponse = self.decode(response).await?;

        tracing::debug!(
            partition = %partition,
            offset = request.offset,
            records = body.records.len(),
            total = ?body.total,
            identity = %identity.label(),
            "Fetched page"
        );
        Ok(Page {
            records: body.records,
            total: body.total,
        })
    }
}
