use std::time::Duration;

/// HTTP retrieval settings for feed documents.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout: Duration,
    /// Retries after the first attempt; 0 means one attempt total.
    pub retries: u32,
    pub retry_base: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "newswire/0.1".to_string(),
            timeout: Duration::from_secs(30),
            retries: 2,
            retry_base: Duration::from_secs(1),
        }
    }
}

/// Credentials for the external entity-recognition capability. Absence of
/// this whole struct disables extraction; it is never a partial default.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub endpoint: String,
    pub api_key: String,
}

/// Everything a scheduler needs beyond the database pool.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub fetch: FetchConfig,
    /// How many feed pipelines may run concurrently.
    pub concurrency: usize,
    /// Total attempts against the extraction capability per item.
    pub extraction_attempts: u32,
    pub extraction_retry_base: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            concurrency: 8,
            extraction_attempts: 3,
            extraction_retry_base: Duration::from_secs(2),
        }
    }
}
