//! On-duty search results scraped from the chamber's public portal page.
//!
//! The portal fills its result table with JavaScript, so the page is loaded
//! in a browser driven over WebDriver. The search waits a bounded time for the
//! first `.searchResultEntry`; a page that never shows one is a timeout.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use fantoccini::{Client, ClientBuilder, Locator, error::CmdError, wd::Capabilities};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use std::time::Duration;

use crate::{
    Config,
    model::{PharmacyRecord, compose_address, parse_distance},
};

use super::{PharmacySource, SourceError, SourceId};

const ENTRY_SELECTOR: &str = ".searchResultEntry";

#[derive(Debug, Clone)]
pub struct PortalSource {
    base_url: String,
    location: String,
    webdriver_url: String,
    timeout: Duration,
}

impl PortalSource {
    pub fn new(base_url: String, location: String, webdriver_url: String, timeout: Duration) -> Self {
        Self { base_url, location, webdriver_url, timeout }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let location = config.location.clone().ok_or_else(|| {
            anyhow!(
                "No LOCATION configured for the portal source.\n\
                 Hint: set LOCATION to the portal's location code."
            )
        })?;

        Ok(Self::new(
            config.portal_url.clone(),
            location,
            config.webdriver_url.clone(),
            config.fetch_timeout(),
        ))
    }

    /// Query parameters for the search on `date`, e.g. `date=01.05.2024`.
    pub fn search_query(&self, date: NaiveDate) -> Vec<(&'static str, String)> {
        vec![("date", date.format("%d.%m.%Y").to_string()), ("location", self.location.clone())]
    }

    pub fn search_url(&self, date: NaiveDate) -> Result<Url, SourceError> {
        Url::parse_with_params(&self.base_url, self.search_query(date))
            .map_err(|_| SourceError::Url(self.base_url.clone()))
    }

    async fn connect(&self) -> Result<Client, SourceError> {
        let mut capabilities = Capabilities::new();
        capabilities.insert("pageLoadStrategy".to_string(), json!("none"));
        capabilities.insert(
            "goog:chromeOptions".to_string(),
            json!({ "args": ["--headless=new", "--disable-gpu", "--no-sandbox"] }),
        );
        capabilities.insert("moz:firefoxOptions".to_string(), json!({ "args": ["-headless"] }));

        ClientBuilder::native()
            .capabilities(capabilities)
            .connect(&self.webdriver_url)
            .await
            .map_err(|source| SourceError::WebDriver { url: self.webdriver_url.clone(), source })
    }

    /// Open `url` and return the page source once result entries are present.
    async fn rendered_results(&self, browser: &Client, url: &Url) -> Result<String, SourceError> {
        let load = async {
            browser.goto(url.as_str()).await?;
            browser.wait().at_most(self.timeout).for_element(Locator::Css(ENTRY_SELECTOR)).await?;
            browser.source().await
        };

        load.await.map_err(|e| browser_error(url.as_str(), self.timeout, e))
    }

    async fn fetch_on(&self, date: NaiveDate) -> Result<Vec<PharmacyRecord>, SourceError> {
        let url = self.search_url(date)?;
        tracing::info!(url = %url, webdriver = %self.webdriver_url, "Loading portal page");

        let browser = self.connect().await?;
        let page = self.rendered_results(&browser, &url).await;
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser session");
        }

        let records = extract_entries(&page?)?;
        tracing::info!(count = records.len(), "Found pharmacy entries");
        Ok(records)
    }
}

#[async_trait]
impl PharmacySource for PortalSource {
    fn id(&self) -> SourceId {
        SourceId::Portal
    }

    async fn fetch(&self) -> Result<Vec<PharmacyRecord>, SourceError> {
        self.fetch_on(Local::now().date_naive()).await
    }
}

/// An expired wait for result markup is a timeout; anything else is a browser failure.
fn browser_error(url: &str, timeout: Duration, error: CmdError) -> SourceError {
    match error {
        CmdError::WaitTimeout => SourceError::Timeout { url: url.to_string(), after: timeout },
        source => SourceError::Browser { url: url.to_string(), source },
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|_| SourceError::Selector(css.to_string()))
}

/// Visible text of an element with runs of whitespace collapsed.
fn inner_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Compiled selectors for one search result entry.
struct EntrySelectors {
    entry: Selector,
    name: Selector,
    phone: Selector,
    street: Selector,
    zip_code: Selector,
    location: Selector,
    service_time: Selector,
}

impl EntrySelectors {
    fn new() -> Result<Self, SourceError> {
        Ok(Self {
            entry: selector(ENTRY_SELECTOR)?,
            name: selector(".name")?,
            phone: selector(".phone")?,
            street: selector(".street")?,
            zip_code: selector(".zipCode")?,
            location: selector(".location")?,
            service_time: selector(".serviceTime")?,
        })
    }
}

/// One record per `.searchResultEntry`; the n-th entry's distance is read from
/// the document-wide `#distance-{n}` element.
pub fn extract_entries(html: &str) -> Result<Vec<PharmacyRecord>, SourceError> {
    let document = Html::parse_document(html);
    let sel = EntrySelectors::new()?;

    document
        .select(&sel.entry)
        .enumerate()
        .map(|(index, row)| {
            let field = |css: &Selector, name: &'static str| {
                row.select(css)
                    .next()
                    .map(inner_text)
                    .ok_or(SourceError::MissingField { index, field: name })
            };

            let street = field(&sel.street, "street")?;
            let zip_code = field(&sel.zip_code, "zipCode")?;
            let locality = field(&sel.location, "location")?;

            let distance_text = document
                .select(&selector(&format!("#distance-{index}"))?)
                .next()
                .map(inner_text)
                .ok_or(SourceError::MissingField { index, field: "distance" })?;
            let distance = parse_distance(&distance_text).ok_or_else(|| {
                SourceError::InvalidField { index, field: "distance", value: distance_text.clone() }
            })?;

            Ok(PharmacyRecord {
                name: field(&sel.name, "name")?,
                phone: field(&sel.phone, "phone")?,
                address: compose_address(&street, &zip_code, &locality),
                street,
                zip_code,
                locality,
                service_time: field(&sel.service_time, "serviceTime")?,
                distance,
                distance_text,
                ..Default::default()
            })
        })
        .collect()
}
