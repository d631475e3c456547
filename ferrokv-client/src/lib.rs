//! A small `reqwest`-based Rust SDK for the coordinator's HTTP API
//! (SPEC_FULL.md §2). Exists so the integration-test suite — and any
//! external caller — can drive the cluster without hand-building JSON
//! requests and status-code checks for every call site.

use std::time::Duration;

use ferrokv_core::{
    QuorumReadResponse, RecordPayload, RegisterRequest, Role, StatusResponse, StorageReadResponse,
    StorageWriteResponse, TableRequest,
};
use reqwest::{Client, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum FerroKvError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("the record was not found")]
    NotFound,

    #[error("the coordinator rejected the request with status {status}: {message}")]
    Api { status: StatusCode, message: String },
}

pub type Result<T> = std::result::Result<T, FerroKvError>;

/// A typed client for one coordinator. Cheap to clone; holds a pooled
/// `reqwest::Client` internally, mirroring the coordinator's own one
/// process-wide HTTP client (SPEC_FULL.md §4.3).
#[derive(Clone, Debug)]
pub struct FerroKvClient {
    base_url: String,
    http: Client,
}

impl FerroKvClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    pub async fn register_shard(
        &self,
        shard_id: &str,
        url: &str,
        role: Role,
    ) -> Result<StatusResponse> {
        let endpoint = format!("{}/shards/register", self.base_url);
        let resp = self
            .http
            .post(&endpoint)
            .json(&RegisterRequest {
                shard_id: shard_id.to_string(),
                url: url.to_string(),
                role,
            })
            .send()
            .await?;
        status_of(resp).await
    }

    pub async fn create_table(&self, name: &str) -> Result<StatusResponse> {
        let endpoint = format!("{}/tables", self.base_url);
        let resp = self
            .http
            .post(&endpoint)
            .json(&TableRequest {
                name: name.to_string(),
            })
            .send()
            .await?;
        status_of(resp).await
    }

    pub async fn put(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
        value: serde_json::Value,
    ) -> Result<StorageWriteResponse> {
        let endpoint = format!("{}/tables/{table}/records", self.base_url);
        let resp = self
            .http
            .post(&endpoint)
            .json(&RecordPayload {
                partition_key: partition_key.to_string(),
                sort_key: sort_key.map(str::to_string),
                value,
            })
            .send()
            .await?;
        let body = expect_success(resp).await?;
        body.json::<StorageWriteResponse>()
            .await
            .map_err(FerroKvError::Transport)
    }

    pub async fn get(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<StorageReadResponse> {
        let endpoint = self.record_url(table, partition_key, sort_key);
        let resp = self.http.get(&endpoint).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(FerroKvError::NotFound);
        }
        let body = expect_success(resp).await?;
        body.json::<StorageReadResponse>()
            .await
            .map_err(FerroKvError::Transport)
    }

    pub async fn exists(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<bool> {
        let endpoint = self.record_url(table, partition_key, sort_key);
        let resp = self.http.head(&endpoint).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(FerroKvError::Api {
                status,
                message: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<StatusResponse> {
        let endpoint = self.record_url(table, partition_key, sort_key);
        let resp = self.http.delete(&endpoint).send().await?;
        status_of(resp).await
    }

    pub async fn quorum_read(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
        r: usize,
    ) -> Result<QuorumReadResponse> {
        let mut endpoint = format!(
            "{}/tables/{table}/records/{partition_key}/quorum?R={r}",
            self.base_url
        );
        if let Some(sk) = sort_key {
            endpoint.push_str(&format!("&sort_key={sk}"));
        }
        let resp = self.http.get(&endpoint).send().await?;
        let body = expect_success(resp).await?;
        body.json::<QuorumReadResponse>()
            .await
            .map_err(FerroKvError::Transport)
    }

    fn record_url(&self, table: &str, partition_key: &str, sort_key: Option<&str>) -> String {
        let mut url = format!(
            "{}/tables/{table}/records/{partition_key}",
            self.base_url
        );
        if let Some(sk) = sort_key {
            url.push_str(&format!("?sort_key={sk}"));
        }
        url
    }
}

async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status();
        let message = resp.text().await.unwrap_or_default();
        Err(FerroKvError::Api { status, message })
    }
}

async fn status_of(resp: reqwest::Response) -> Result<StatusResponse> {
    expect_success(resp)
        .await?
        .json::<StatusResponse>()
        .await
        .map_err(FerroKvError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_url_without_sort_key_has_no_query_string() {
        let client = FerroKvClient::new("http://coordinator.local");
        assert_eq!(
            client.record_url("orders", "order-101", None),
            "http://coordinator.local/tables/orders/records/order-101"
        );
    }

    #[test]
    fn record_url_with_sort_key_appends_query_string() {
        let client = FerroKvClient::new("http://coordinator.local");
        assert_eq!(
            client.record_url("orders", "user-vip", Some("order-2023-01")),
            "http://coordinator.local/tables/orders/records/user-vip?sort_key=order-2023-01"
        );
    }
}
