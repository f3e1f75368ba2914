pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::error::ScrapeError;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use self::http_client::HttpClient;
use self::parsers::{extract_form_fields, has_element, input_name_by_id};

const DATE_FIELD_ID: &str = "txtShareholdingDate";
const CODE_FIELD_ID: &str = "txtStockCode";
const SEARCH_BUTTON_ID: &str = "btnSearch";

// ── Fetcher trait ─────────────────────────────────────────────────────────────

/// One exclusive session against the disclosure site.
///
/// `prepare_search` sets the session's date context once per day; every
/// following `search_security` runs against that date.
#[async_trait]
pub trait PageFetcher: Send {
    async fn fetch_security_list(&mut self, date: NaiveDate) -> Result<String, ScrapeError>;
    async fn prepare_search(&mut self, date: NaiveDate) -> Result<(), ScrapeError>;
    async fn search_security(&mut self, stock_code: &str) -> Result<String, ScrapeError>;

    /// Release the session once its day has returned, successfully or not.
    /// A panicking unit skips this and drops the session, so anything that
    /// must be released also belongs in `Drop`.
    async fn close(&mut self) {}
}

/// Opens a fresh session for the numbered unit of a run.
pub type SessionFactory =
    Arc<dyn Fn(usize) -> Result<Box<dyn PageFetcher>, ScrapeError> + Send + Sync>;

pub fn hkex_session_factory(config: &ScraperConfig) -> SessionFactory {
    let config = config.clone();
    Arc::new(move |unit| {
        debug!("unit {}: opening session", unit);
        Ok(Box::new(HkexSession::new(&config)?) as Box<dyn PageFetcher>)
    })
}

// ── HKEX session ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Request<'a> {
    Get(&'a str),
    Post(&'a str, &'a [(String, String)]),
}

struct SearchForm {
    date: NaiveDate,
    fields: HashMap<String, String>,
    code_field: String,
}

pub struct HkexSession {
    client: HttpClient,
    config: ScraperConfig,
    form: Option<SearchForm>,
}

impl HkexSession {
    pub fn new(config: &ScraperConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: HttpClient::new(config)?,
            config: config.clone(),
            form: None,
        })
    }

    fn stock_list_url(&self, date: NaiveDate) -> String {
        format!("{}{}", self.config.stock_list_url, date.format("%Y%m%d"))
    }

    /// Re-issue `request` until the page contains `selector` or the wait bound elapses.
    async fn poll_until(&self, request: Request<'_>, selector: &str) -> Result<String, ScrapeError> {
        let waited = self.config.wait_timeout();
        match timeout(waited, self.poll_loop(request, selector)).await {
            Ok(result) => result,
            Err(_) => Err(ScrapeError::ElementNotFound {
                selector: selector.to_string(),
                waited,
            }),
        }
    }

    async fn poll_loop(&self, request: Request<'_>, selector: &str) -> Result<String, ScrapeError> {
        loop {
            let html = match request {
                Request::Get(url) => self.client.get_text(url).await?,
                Request::Post(url, form) => self.client.post_form(url, form).await?,
            };
            if has_element(&html, selector)? {
                return Ok(html);
            }
            debug!("`{}` not rendered yet, polling", selector);
            sleep(self.config.poll_interval()).await;
        }
    }
}

#[async_trait]
impl PageFetcher for HkexSession {
    async fn fetch_security_list(&mut self, date: NaiveDate) -> Result<String, ScrapeError> {
        let url = self.stock_list_url(date);
        info!("Fetching security list for {} ({})", date, url);
        self.poll_until(Request::Get(&url), "table").await
    }

    async fn prepare_search(&mut self, date: NaiveDate) -> Result<(), ScrapeError> {
        let url = self.config.search_url.clone();
        let html = self
            .poll_until(Request::Get(&url), &format!("#{}", DATE_FIELD_ID))
            .await
            .map_err(|e| ScrapeError::Navigation(format!("search form unavailable: {}", e)))?;

        if !has_element(&html, &format!("#{}", SEARCH_BUTTON_ID))? {
            return Err(ScrapeError::Navigation("search button missing".into()));
        }

        let mut fields = extract_form_fields(&html)?;
        let date_field =
            input_name_by_id(&html, DATE_FIELD_ID)?.unwrap_or_else(|| DATE_FIELD_ID.to_string());
        let code_field =
            input_name_by_id(&html, CODE_FIELD_ID)?.unwrap_or_else(|| CODE_FIELD_ID.to_string());
        fields.insert(date_field, date.format("%Y/%m/%d").to_string());

        debug!("Search form ready for {} ({} fields)", date, fields.len());
        self.form = Some(SearchForm { date, fields, code_field });
        Ok(())
    }

    async fn search_security(&mut self, stock_code: &str) -> Result<String, ScrapeError> {
        let Some(form) = self.form.as_ref() else {
            return Err(ScrapeError::Navigation("search form not prepared".into()));
        };

        let mut fields = form.fields.clone();
        fields.insert(form.code_field.clone(), stock_code.to_string());
        fields.insert("__EVENTTARGET".into(), SEARCH_BUTTON_ID.into());
        fields.insert("__EVENTARGUMENT".into(), String::new());
        let body: Vec<(String, String)> = fields.into_iter().collect();
        debug!("Searching {} on {}", stock_code, form.date);

        let url = self.config.search_url.clone();
        let html = self
            .poll_until(Request::Post(&url, &body), &format!("#{}", CODE_FIELD_ID))
            .await?;

        // ASP.NET rotates its hidden state on every postback
        if let Some(form) = self.form.as_mut() {
            for (name, value) in extract_form_fields(&html)? {
                if name.starts_with("__") {
                    form.fields.insert(name, value);
                }
            }
        }

        Ok(html)
    }

    async fn close(&mut self) {
        if let Some(form) = self.form.take() {
            debug!("Closing session for {}", form.date);
        }
    }
}

impl Drop for HkexSession {
    fn drop(&mut self) {
        // cookie jar and pooled connections go with the client
        if let Some(form) = self.form.take() {
            debug!("Session for {} dropped without close", form.date);
        }
    }
}
