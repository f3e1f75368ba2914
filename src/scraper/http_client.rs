use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

/// Cookie-holding HTTP client owned by exactly one session.
pub struct HttpClient {
    inner: reqwest::Client,
    config: ScraperConfig,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self, ScrapeError> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.wait_timeout())
            .gzip(true)
            // ASP.NET session cookie ties the date picker to later searches
            .cookie_store(true)
            .build()?;

        Ok(Self {
            inner,
            config: config.clone(),
        })
    }

    /// GET a URL as text with polite delay and retry.
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        self.polite_delay().await;
        let client = &self.inner;
        RetryIf::spawn(
            self.backoff(),
            move || async move {
                debug!("GET {}", url);
                let resp = client.get(url).send().await?;
                Self::body(url, resp).await
            },
            is_transient,
        )
        .await
    }

    /// POST a urlencoded form as text with polite delay and retry.
    pub async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<String, ScrapeError> {
        self.polite_delay().await;
        let client = &self.inner;
        RetryIf::spawn(
            self.backoff(),
            move || async move {
                debug!("POST {} ({} fields)", url, form.len());
                let resp = client.post(url).form(form).send().await?;
                Self::body(url, resp).await
            },
            is_transient,
        )
        .await
    }

    async fn body(url: &str, resp: reqwest::Response) -> Result<String, ScrapeError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.config.request_delay_ms.max(1) / 2 + 1)
            .max_delay(self.config.wait_timeout())
            .map(jitter)
            .take(self.config.max_retries as usize)
    }

    /// Sleep for the configured delay + random jitter.
    async fn polite_delay(&self) {
        let jitter = rand::random_range(0..=self.config.jitter_ms);
        sleep(Duration::from_millis(self.config.request_delay_ms + jitter)).await;
    }
}

/// Retry rate limiting, server errors and transport failures; give up on other 4xx.
fn is_transient(err: &ScrapeError) -> bool {
    let retry = match err {
        ScrapeError::Status { status, .. } => *status == 429 || *status >= 500,
        ScrapeError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    };
    if retry {
        warn!("Transient failure, retrying: {}", err);
    }
    retry
}
