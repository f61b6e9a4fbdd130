//! HTTP backend for replaying queued mutations.
//!
//! Routes:
//! - CREATE → `POST {base}/{collection}`
//! - UPDATE → `PUT {base}/{collection}/{id}`
//! - DELETE → `DELETE {base}/{collection}/{id}`
//! - anything else → `POST {base}/{collection}[/{id}]/{kind}`

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use std::time::Duration;
use url::Url;

use outpost_app::{QueuedMutation, ReachabilityProbe, RemoteExecutor};
use outpost_common::{Error, OperationKind, Result};

/// Header carrying the mutation id so the server can drop duplicate replays.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Build the request line for a mutation.
pub fn route(base: &Url, mutation: &QueuedMutation) -> Result<(Method, Url)> {
    let target = &mutation.target;
    let record_id = || {
        target.record_id.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("{} on {} needs a record id", mutation.operation, target))
        })
    };

    let (method, segments): (Method, Vec<&str>) = match &mutation.operation {
        OperationKind::Create => (Method::POST, vec![target.collection.as_str()]),
        OperationKind::Update => (Method::PUT, vec![target.collection.as_str(), record_id()?]),
        OperationKind::Delete => (Method::DELETE, vec![target.collection.as_str(), record_id()?]),
        OperationKind::Custom(kind) => {
            let mut segments = vec![target.collection.as_str()];
            if let Some(id) = target.record_id.as_deref() {
                segments.push(id);
            }
            segments.push(kind.as_str());
            (Method::POST, segments)
        }
    };

    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::InvalidInput(format!("Cannot use {} as a base URL", base)))?
        .pop_if_empty()
        .extend(segments);

    Ok((method, url))
}

/// Map a response status to the retry taxonomy.
pub fn classify(status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(Error::TransientRemote(format!("Server answered {}", status)))
    } else {
        Err(Error::PermanentRemote(format!("Server rejected mutation: {}", status)))
    }
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::InvalidInput(format!("Failed to build HTTP client: {}", e)))
}

/// Replays mutations as REST calls.
pub struct HttpRemote {
    http: Client,
    base: Url,
}

impl HttpRemote {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base,
        })
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemote {
    async fn execute(&self, mutation: &QueuedMutation) -> Result<()> {
        let (method, url) = route(&self.base, mutation)?;

        let mut request = self
            .http
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, mutation.id.as_str());
        if !mutation.payload.is_empty() {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .body(mutation.payload.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::TransientRemote(format!("Request failed: {}", e)))?;

        classify(response.status())
    }
}

/// Reachability check: `GET {base}` answered by anything but a server error.
pub struct HttpProbe {
    http: Client,
    base: Url,
}

impl HttpProbe {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: client(timeout)?,
            base,
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn check(&self) -> Result<()> {
        let response = self
            .http
            .get(self.base.clone())
            .send()
            .await
            .map_err(|e| Error::TransientRemote(format!("Probe failed: {}", e)))?;

        if response.status().is_server_error() {
            return Err(Error::TransientRemote(format!(
                "Probe answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}
