use crate::config::FetchConfig;
use crate::types::{IngestError, Result};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use reqwest::Client;
use tracing::{debug, warn};

/// Retrieves one feed's raw document over HTTP with a bounded timeout and a
/// bounded number of retries. Transport faults and non-success statuses are
/// both `Fetch` errors, contained at the per-feed boundary.
pub struct Fetcher {
    client: Client,
    retries: u32,
    retry_base: std::time::Duration,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(|e| IngestError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retries: config.retries,
            retry_base: config.retry_base,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<String> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.retry_base,
            initial_interval: self.retry_base,
            max_interval: self.retry_base * 32,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut last_reason = String::new();

        for attempt in 0..=self.retries {
            match self.fetch_once(url).await {
                Ok(body) => {
                    debug!("fetched {} ({} bytes)", url, body.len());
                    return Ok(body);
                }
                Err(reason) => {
                    last_reason = reason;
                    if attempt < self.retries {
                        if let Some(delay) = backoff.next_backoff() {
                            warn!(
                                "attempt {} failed for {} ({}), retrying in {:?}",
                                attempt + 1,
                                url,
                                last_reason,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(IngestError::Fetch {
            url: url.to_string(),
            reason: last_reason,
        })
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            ));
        }

        response.text().await.map_err(|e| e.to_string())
    }
}
