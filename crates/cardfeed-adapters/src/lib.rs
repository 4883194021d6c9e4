//! Source walker contracts + raw payload shapes for the catalog and search APIs.
//!
//! Raw shapes are validated here, at the ingestion boundary; nothing
//! loosely-typed leaks past the normalizer in `cardfeed-sync`.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use cardfeed_storage::{ArtifactStore, RateLimitedFetcher, SearchAuth};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "cardfeed-adapters";

/// `{ results: [...] }` envelope used by every catalog endpoint. An absent
/// `results` key is an empty list, not an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsEnvelope<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGroup {
    pub group_id: i64,
    #[serde(default)]
    pub category_id: i64,
    pub name: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub published_on: Option<String>,
    #[serde(default)]
    pub modified_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExtendedData {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProduct {
    pub product_id: i64,
    #[serde(default)]
    pub category_id: i64,
    #[serde(default)]
    pub group_id: i64,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extended_data: Vec<RawExtendedData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPrice {
    pub product_id: i64,
    #[serde(default)]
    pub sub_type_name: String,
    #[serde(default)]
    pub market_price: Option<f64>,
    #[serde(default)]
    pub low_price: Option<f64>,
    #[serde(default)]
    pub mid_price: Option<f64>,
    #[serde(default)]
    pub high_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMoney {
    pub value: String,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawImage {
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItemSummary {
    pub item_id: String,
    pub title: String,
    #[serde(default)]
    pub image: Option<RawImage>,
    #[serde(default)]
    pub price: Option<RawMoney>,
    #[serde(default)]
    pub item_web_url: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

impl RawItemSummary {
    pub fn price_value(&self) -> Option<f64> {
        self.price.as_ref().and_then(|m| m.value.parse::<f64>().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawApiError {
    #[serde(default)]
    pub error_id: i64,
    #[serde(default)]
    pub message: Option<String>,
}

/// The search endpoint returns either `itemSummaries` or an `errors` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchEnvelope {
    #[serde(default)]
    pub item_summaries: Option<Vec<RawItemSummary>>,
    #[serde(default)]
    pub errors: Option<Vec<RawApiError>>,
}

/// Rate limiting signaled inside a 200 payload rather than a 429 status.
const RATE_LIMIT_ERROR_ID: i64 = 10001;

/// Sorts search results deterministically: price ascending, unpriced items
/// last, item id as the tiebreak. Re-running the same query over the same
/// upstream data yields the same order.
pub fn sort_item_summaries(items: &mut [RawItemSummary]) {
    items.sort_by(|a, b| {
        match (a.price_value(), b.price_value()) {
            (Some(pa), Some(pb)) => pa.total_cmp(&pb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.item_id.cmp(&b.item_id))
    });
}

/// Walker over the catalog hierarchy: category → groups → products/prices.
///
/// Group and product failures yield empty and must not abort sibling units.
/// Prices distinguish an unavailable unit (`None`: budget gate, fetch or
/// parse failure) from a genuinely empty one, so callers can avoid replacing
/// priced rows with price-less ones.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_groups(&self, category_id: i64) -> Vec<RawGroup>;
    async fn list_products(&self, category_id: i64, group_id: i64) -> Vec<RawProduct>;
    async fn list_prices(&self, category_id: i64, group_id: i64) -> Option<Vec<RawPrice>>;
}

/// Walker over the search source: one bounded, deterministically ordered
/// result page per query.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn search(&self, query: &str, limit: u32) -> Vec<RawItemSummary>;
}

pub struct HttpCatalogSource {
    fetcher: Arc<RateLimitedFetcher>,
    base_url: String,
    artifacts: Option<Arc<ArtifactStore>>,
}

impl HttpCatalogSource {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        base_url: impl Into<String>,
        artifacts: Option<Arc<ArtifactStore>>,
    ) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            artifacts,
        }
    }

    /// `None` means the unit could not be fetched at all; `Some(vec![])` is a
    /// successful fetch of an empty list.
    async fn fetch_results<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        label: &str,
    ) -> Option<Vec<T>> {
        if self.fetcher.budget().is_exhausted() {
            warn!(url, "call budget exhausted, skipping catalog fetch");
            return None;
        }
        let bytes = match self.fetcher.get(url, &[], None).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(url, error = %err, "catalog fetch failed");
                return None;
            }
        };
        capture_payload(self.artifacts.as_deref(), "catalog", label, &bytes).await;
        match serde_json::from_slice::<ResultsEnvelope<T>>(&bytes) {
            Ok(envelope) => Some(envelope.results),
            Err(err) => {
                warn!(url, error = %err, "catalog payload did not parse");
                None
            }
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn list_groups(&self, category_id: i64) -> Vec<RawGroup> {
        let url = format!("{}/{}/groups", self.base_url.trim_end_matches('/'), category_id);
        self.fetch_results(&url, &format!("groups-{category_id}"))
            .await
            .unwrap_or_default()
    }

    async fn list_products(&self, category_id: i64, group_id: i64) -> Vec<RawProduct> {
        let url = format!(
            "{}/{}/{}/products",
            self.base_url.trim_end_matches('/'),
            category_id,
            group_id
        );
        self.fetch_results(&url, &format!("products-{category_id}-{group_id}"))
            .await
            .unwrap_or_default()
    }

    async fn list_prices(&self, category_id: i64, group_id: i64) -> Option<Vec<RawPrice>> {
        let url = format!(
            "{}/{}/{}/prices",
            self.base_url.trim_end_matches('/'),
            category_id,
            group_id
        );
        self.fetch_results(&url, &format!("prices-{category_id}-{group_id}")).await
    }
}

pub struct HttpListingSource {
    fetcher: Arc<RateLimitedFetcher>,
    auth: SearchAuth,
    base_url: String,
    artifacts: Option<Arc<ArtifactStore>>,
}

impl HttpListingSource {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        auth: SearchAuth,
        base_url: impl Into<String>,
        artifacts: Option<Arc<ArtifactStore>>,
    ) -> Self {
        Self {
            fetcher,
            auth,
            base_url: base_url.into(),
            artifacts,
        }
    }
}

/// How one parsed search response should be handled by the walker.
enum SearchOutcome {
    Items(Vec<RawItemSummary>),
    /// The API reported its rate limit inside a 200 payload; retryable like a
    /// 429 status.
    RateLimited,
    Failed,
}

fn classify_search_payload(bytes: &[u8], query: &str) -> SearchOutcome {
    let envelope = match serde_json::from_slice::<SearchEnvelope>(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(query, error = %err, "search payload did not parse");
            return SearchOutcome::Failed;
        }
    };
    if let Some(errors) = &envelope.errors {
        if errors.iter().any(|e| e.error_id == RATE_LIMIT_ERROR_ID) {
            return SearchOutcome::RateLimited;
        }
        if let Some(first) = errors.first() {
            warn!(
                query,
                error_id = first.error_id,
                message = first.message.as_deref().unwrap_or(""),
                "search API returned errors"
            );
        }
        return SearchOutcome::Failed;
    }
    let mut items = envelope.item_summaries.unwrap_or_default();
    sort_item_summaries(&mut items);
    SearchOutcome::Items(items)
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn search(&self, query: &str, limit: u32) -> Vec<RawItemSummary> {
        let backoff = *self.fetcher.backoff();
        let url = format!(
            "{}/item_summary/search",
            self.base_url.trim_end_matches('/')
        );
        let params = [
            ("q", query.to_string()),
            ("limit", limit.to_string()),
            ("sort", "price".to_string()),
        ];

        for attempt in 0..=backoff.max_retries {
            if self.fetcher.budget().is_exhausted() {
                warn!(query, "call budget exhausted, skipping search");
                return Vec::new();
            }
            let token = match self.auth.bearer_token().await {
                Ok(token) => token,
                Err(err) => {
                    warn!(query, error = %err, "token refresh failed mid-run, yielding empty unit");
                    return Vec::new();
                }
            };
            let bytes = match self.fetcher.get(&url, &params, Some(&token)).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(query, error = %err, "search fetch failed, yielding empty unit");
                    return Vec::new();
                }
            };
            capture_payload(self.artifacts.as_deref(), "search", query, &bytes).await;

            match classify_search_payload(&bytes, query) {
                SearchOutcome::Items(items) => return items,
                SearchOutcome::Failed => return Vec::new(),
                SearchOutcome::RateLimited if attempt < backoff.max_retries => {
                    let delay = backoff.exponential_delay(attempt);
                    warn!(query, ?delay, "search API reported rate limit in payload, backing off");
                    tokio::time::sleep(delay).await;
                }
                SearchOutcome::RateLimited => {
                    warn!(query, "rate limit persisted through retries, yielding empty unit");
                }
            }
        }
        Vec::new()
    }
}

async fn capture_payload(
    artifacts: Option<&ArtifactStore>,
    source: &str,
    label: &str,
    bytes: &[u8],
) {
    let Some(store) = artifacts else {
        return;
    };
    if let Err(err) = store
        .store_payload(Utc::now(), source, label, "json", bytes)
        .await
    {
        warn!(source, label, error = %err, "failed to archive raw payload");
    }
}
