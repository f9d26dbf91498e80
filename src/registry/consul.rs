//! Consul implementation of [`RegistryGateway`] using blocking queries.
//!
//! Every call passes `index` and `wait` query parameters and reads the
//! next index from the `X-Consul-Index` response header.

use super::{Fetched, RegistryGateway};
use crate::error::{Error, Result};
use crate::types::{CheckStatus, InstanceId, InstanceRecord, InstanceSnapshot, ServiceSnapshot, WaitIndex};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra time on top of the wait (and Consul's wait/16 jitter) before the
/// client gives up on a request.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

pub struct ConsulGateway {
    client: Client,
    base: Url,
    max_wait: Duration,
    token: Option<String>,
    datacenter: Option<String>,
}

impl ConsulGateway {
    pub fn new(address: &str, max_wait: Duration) -> Result<Self> {
        let base = Url::parse(address)
            .map_err(|e| Error::Misconfiguration(format!("invalid registry address {}: {}", address, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Misconfiguration(format!(
                "registry address {} is not an http(s) URL",
                address
            )));
        }

        let client = Client::builder()
            .timeout(max_wait + max_wait / 16 + REQUEST_SLACK)
            .build()
            .map_err(Error::Connection)?;

        Ok(Self {
            client,
            base,
            max_wait,
            token: None,
            datacenter: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_datacenter(mut self, datacenter: Option<String>) -> Self {
        self.datacenter = datacenter;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // `new` rejected cannot-be-a-base URLs, so this always succeeds.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn blocking_get(&self, url: Url, index: WaitIndex) -> RequestBuilder {
        let wait = format!("{}s", self.max_wait.as_secs().max(1));
        let mut request = self
            .client
            .get(url)
            .query(&[("index", index.get().to_string()), ("wait", wait)]);

        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> Result<(Response, WaitIndex)> {
        let response = request.send().await.map_err(Error::Connection)?;

        let status = response.status();
        if !status.is_success() {
            let body = body_or_reason(response.text().await);
            return Err(Error::Registry(format!("HTTP {}: {}", status, body)));
        }

        let index = parse_index(&response)?;
        Ok((response, index))
    }
}

fn body_or_reason<E: std::fmt::Display>(body: std::result::Result<String, E>) -> String {
    match body {
        Ok(text) => text.trim().to_string(),
        Err(e) => format!("<unreadable body: {}>", e),
    }
}

fn parse_index(response: &Response) -> Result<WaitIndex> {
    let raw = response
        .headers()
        .get(INDEX_HEADER)
        .ok_or_else(|| Error::Registry(format!("response is missing {}", INDEX_HEADER)))?;
    let value = raw
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::Registry(format!("invalid {} header: {:?}", INDEX_HEADER, raw)))?;

    // Consul may report 0 for empty results; blocking on 0 would return
    // immediately forever.
    Ok(WaitIndex(value.max(1)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    node: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

impl From<HealthEntry> for InstanceRecord {
    fn from(entry: HealthEntry) -> Self {
        InstanceRecord {
            id: InstanceId::new(entry.node.node, entry.service.id),
            checks: entry
                .checks
                .iter()
                .map(|c| CheckStatus::parse(&c.status))
                .collect(),
        }
    }
}

#[async_trait]
impl RegistryGateway for ConsulGateway {
    async fn fetch_service_names(&self, index: WaitIndex) -> Result<Fetched<ServiceSnapshot>> {
        let url = self.endpoint(&["v1", "catalog", "services"]);
        let (response, new_index) = self.send(self.blocking_get(url, index)).await?;

        let services: HashMap<String, Vec<String>> = response
            .json()
            .await
            .map_err(|e| Error::Registry(format!("failed to decode service catalog: {}", e)))?;
        debug!("Catalog lists {} services at index {}", services.len(), new_index);

        Ok(Fetched::new(services.into_keys().collect(), new_index))
    }

    async fn fetch_service_instances(
        &self,
        service: &str,
        index: WaitIndex,
    ) -> Result<Fetched<InstanceSnapshot>> {
        let url = self.endpoint(&["v1", "health", "service", service]);
        let (response, new_index) = self.send(self.blocking_get(url, index)).await?;

        let entries: Vec<HealthEntry> = response.json().await.map_err(|e| {
            Error::Registry(format!("failed to decode health of {}: {}", service, e))
        })?;
        debug!(
            "Service {} has {} instances at index {}",
            service,
            entries.len(),
            new_index
        );

        let snapshot = entries
            .into_iter()
            .map(InstanceRecord::from)
            .map(|record| (record.id.clone(), record))
            .collect();
        Ok(Fetched::new(snapshot, new_index))
    }
}
