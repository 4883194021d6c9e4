//! Harvest run orchestration: normalization, dedup, batching, and the
//! budgeted run controller with resume reporting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cardfeed_adapters::{
    CatalogSource, HttpCatalogSource, HttpListingSource, ListingSource, RawGroup, RawItemSummary,
    RawPrice, RawProduct,
};
use cardfeed_core::{CallBudget, CatalogGroup, CatalogProduct, GradedListing};
use cardfeed_storage::{
    ArtifactStore, FetcherConfig, RateLimitedFetcher, RowSink, SearchAuth, UpsertStore,
    UpsertStoreConfig,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardfeed-sync";

pub const GROUPS_TABLE: &str = "catalog_groups";
pub const GROUPS_CONFLICT_KEY: &str = "group_id";
pub const PRODUCTS_TABLE: &str = "catalog_products";
pub const PRODUCTS_CONFLICT_KEY: &str = "product_id";
pub const LISTINGS_TABLE: &str = "graded_listings";
pub const LISTINGS_CONFLICT_KEY: &str = "ebay_item_id";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub store_url: String,
    pub store_key: String,
    pub catalog_base: String,
    pub search_base: String,
    pub token_url: String,
    pub app_id: String,
    pub app_secret: String,
    pub oauth_scope: String,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub call_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            store_url: std::env::var("CARDFEED_STORE_URL").unwrap_or_default(),
            store_key: std::env::var("CARDFEED_STORE_KEY").unwrap_or_default(),
            catalog_base: std::env::var("CARDFEED_CATALOG_BASE")
                .unwrap_or_else(|_| "https://tcgcsv.com/tcgplayer".to_string()),
            search_base: std::env::var("CARDFEED_SEARCH_BASE")
                .unwrap_or_else(|_| "https://api.ebay.com/buy/browse/v1".to_string()),
            token_url: std::env::var("CARDFEED_TOKEN_URL")
                .unwrap_or_else(|_| "https://api.ebay.com/identity/v1/oauth2/token".to_string()),
            app_id: std::env::var("CARDFEED_APP_ID").unwrap_or_default(),
            app_secret: std::env::var("CARDFEED_APP_SECRET").unwrap_or_default(),
            oauth_scope: std::env::var("CARDFEED_OAUTH_SCOPE")
                .unwrap_or_else(|_| "https://api.ebay.com/oauth/api_scope".to_string()),
            artifacts_dir: std::env::var("CARDFEED_ARTIFACTS_DIR").ok().map(PathBuf::from),
            reports_dir: Some(
                std::env::var("CARDFEED_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./reports")),
            ),
            call_delay: Duration::from_millis(
                std::env::var("CARDFEED_CALL_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("CARDFEED_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("CARDFEED_USER_AGENT")
                .unwrap_or_else(|_| "cardfeed-harvester/0.1".to_string()),
        }
    }
}

/// A record failing normalization is excluded, not errored: the run continues
/// and the reason is logged against the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyTitle,
    DenylistedTitle,
    MissingGrading,
    MissingPrice,
    MissingCardNumber,
}

/// Extraction tables, data-driven so tests can enumerate them. Compile once
/// per pipeline via [`NormalizerRules::compile`].
#[derive(Debug, Clone)]
pub struct RulesSpec {
    pub grader_tokens: Vec<String>,
    pub card_number_patterns: Vec<String>,
    pub year_pattern: String,
    pub denylist: Vec<String>,
    pub listing_image_rules: Vec<(String, String)>,
    pub catalog_image_rules: Vec<(String, String)>,
    pub variant_preference: Vec<String>,
}

impl Default for RulesSpec {
    fn default() -> Self {
        Self {
            grader_tokens: ["PSA", "BGS", "CGC", "SGC", "CSG", "HGA", "GMA", "ACE", "TAG"]
                .into_iter()
                .map(String::from)
                .collect(),
            // Ordered, first match wins: fraction form, #N form, set-code form.
            card_number_patterns: vec![
                r"\b(\d{1,4}[a-zA-Z]?\s*/\s*[a-zA-Z]?\d{1,4})\b".to_string(),
                r"#\s*([A-Za-z]{0,3}\d{1,4}[A-Za-z]?)".to_string(),
                r"\b([A-Z]{2,5}-?\d{2,4})\b".to_string(),
            ],
            year_pattern: r"\b(19\d{2}|20\d{2})\b".to_string(),
            denylist: ["lot", "bulk", "box", "case", "sealed", "break", "proxy", "digital"]
                .into_iter()
                .map(String::from)
                .collect(),
            listing_image_rules: ["s-l64.", "s-l140.", "s-l225.", "s-l300.", "s-l500."]
                .into_iter()
                .map(|from| (from.to_string(), "s-l1600.".to_string()))
                .collect(),
            catalog_image_rules: vec![
                ("_200w.".to_string(), "_400w.".to_string()),
                ("_in_200x200".to_string(), "_in_1000x1000".to_string()),
            ],
            variant_preference: vec!["Normal".to_string()],
        }
    }
}

#[derive(Debug)]
pub struct NormalizerRules {
    grader_tokens: Vec<String>,
    grading_pattern: Regex,
    card_number_patterns: Vec<Regex>,
    year_pattern: Regex,
    denylist: Vec<String>,
    listing_image_rules: Vec<(String, String)>,
    catalog_image_rules: Vec<(String, String)>,
    pub variant_preference: Vec<String>,
}

impl NormalizerRules {
    pub fn compile(spec: &RulesSpec) -> Result<Self> {
        anyhow::ensure!(!spec.grader_tokens.is_empty(), "grader token table is empty");
        let grading_pattern = Regex::new(&format!(
            r"(?i)\b({})[\s:\-]*([0-9]{{1,2}}(?:\.5)?)\b",
            spec.grader_tokens.join("|")
        ))
        .context("compiling grading pattern")?;
        let card_number_patterns = spec
            .card_number_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compiling card number pattern {p}")))
            .collect::<Result<Vec<_>>>()?;
        let year_pattern =
            Regex::new(&spec.year_pattern).context("compiling year pattern")?;
        Ok(Self {
            grader_tokens: spec.grader_tokens.clone(),
            grading_pattern,
            card_number_patterns,
            year_pattern,
            denylist: spec.denylist.iter().map(|d| d.to_ascii_lowercase()).collect(),
            listing_image_rules: spec.listing_image_rules.clone(),
            catalog_image_rules: spec.catalog_image_rules.clone(),
            variant_preference: spec.variant_preference.clone(),
        })
    }

    /// First grading-company token followed by a numeric grade wins.
    /// Returns `(grader, grade)` with the grader uppercased.
    pub fn extract_grading(&self, title: &str) -> Option<(String, String)> {
        let captures = self.grading_pattern.captures(title)?;
        let grader = captures.get(1)?.as_str().to_ascii_uppercase();
        let grade = captures.get(2)?.as_str().to_string();
        Some((grader, grade))
    }

    /// Ordered pattern chain, first match wins. Set-code matches that are
    /// really a grader token plus grade (e.g. "PSA10") are skipped.
    pub fn extract_card_number(&self, title: &str) -> Option<String> {
        for pattern in &self.card_number_patterns {
            for captures in pattern.captures_iter(title) {
                let Some(matched) = captures.get(1) else {
                    continue;
                };
                let value: String = matched.as_str().split_whitespace().collect();
                let alpha_prefix: String = value
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect::<String>()
                    .to_ascii_uppercase();
                if !alpha_prefix.is_empty()
                    && self.grader_tokens.iter().any(|t| t == &alpha_prefix)
                {
                    continue;
                }
                return Some(value);
            }
        }
        None
    }

    /// First 4-digit token in 19xx/20xx.
    pub fn extract_year(&self, title: &str) -> Option<i32> {
        self.year_pattern
            .captures(title)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    pub fn is_denylisted(&self, title: &str) -> bool {
        let lower = title.to_ascii_lowercase();
        self.denylist.iter().any(|needle| lower.contains(needle))
    }

    /// Rewrites known thumbnail-size URL tokens to full-size tokens. Never
    /// fabricates a URL: unknown shapes pass through unchanged.
    pub fn upgrade_listing_image(&self, url: &str) -> String {
        upgrade_image(url, &self.listing_image_rules)
    }

    pub fn upgrade_catalog_image(&self, url: &str) -> String {
        upgrade_image(url, &self.catalog_image_rules)
    }
}

fn upgrade_image(url: &str, rules: &[(String, String)]) -> String {
    for (from, to) in rules {
        if url.contains(from.as_str()) {
            return url.replacen(from.as_str(), to, 1);
        }
    }
    url.to_string()
}

/// Listing prices are stored as integer cents, rounded half-up (away from
/// zero; prices are non-negative). Catalog market prices stay decimal dollars.
pub fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

fn parse_source_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn parse_group(raw: &RawGroup, default_category_id: i64) -> CatalogGroup {
    CatalogGroup {
        group_id: raw.group_id,
        category_id: if raw.category_id != 0 {
            raw.category_id
        } else {
            default_category_id
        },
        display_name: raw.name.clone(),
        published_at: raw.published_on.as_deref().and_then(parse_source_timestamp),
        modified_at: raw.modified_on.as_deref().and_then(parse_source_timestamp),
    }
}

/// Most-recently-published first, group id descending as the tiebreak, so a
/// budget-exhausted run stops at a reproducible point.
pub fn sort_groups_newest_first(groups: &mut [RawGroup]) {
    groups.sort_by(|a, b| {
        let a_ts = a.published_on.as_deref().and_then(parse_source_timestamp);
        let b_ts = b.published_on.as_deref().and_then(parse_source_timestamp);
        b_ts.cmp(&a_ts).then_with(|| b.group_id.cmp(&a.group_id))
    });
}

/// Collapses price variants per product id using the preference table: the
/// earliest-ranked sub-type wins, unknown sub-types fall through to first
/// seen. Total and deterministic regardless of input order within a rank.
pub fn merge_prices(prices: Vec<RawPrice>, preference: &[String]) -> HashMap<i64, RawPrice> {
    let mut merged: HashMap<i64, (usize, RawPrice)> = HashMap::new();
    for price in prices {
        let rank = preference
            .iter()
            .position(|p| p.eq_ignore_ascii_case(&price.sub_type_name))
            .unwrap_or(usize::MAX);
        match merged.get(&price.product_id) {
            Some((best_rank, _)) if *best_rank <= rank => {}
            _ => {
                merged.insert(price.product_id, (rank, price));
            }
        }
    }
    merged.into_iter().map(|(k, (_, p))| (k, p)).collect()
}

/// Pure normalization of one search item into a canonical graded listing.
pub fn normalize_listing(
    raw: &RawItemSummary,
    set_name: Option<&str>,
    rules: &NormalizerRules,
) -> std::result::Result<GradedListing, SkipReason> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(SkipReason::EmptyTitle);
    }
    if rules.is_denylisted(title) {
        return Err(SkipReason::DenylistedTitle);
    }
    let (grader, grade) = rules
        .extract_grading(title)
        .ok_or(SkipReason::MissingGrading)?;
    let price = raw.price_value().ok_or(SkipReason::MissingPrice)?;

    Ok(GradedListing {
        ebay_item_id: raw.item_id.clone(),
        title: title.to_string(),
        image_url: raw
            .image
            .as_ref()
            .map(|i| rules.upgrade_listing_image(&i.image_url)),
        price_cents: dollars_to_cents(price),
        grader,
        grade,
        set_name: set_name.map(String::from),
        year: rules.extract_year(title),
        card_number: rules.extract_card_number(title),
        source_metadata: serde_json::json!({
            "item_web_url": raw.item_web_url,
            "condition": raw.condition,
            "currency": raw.price.as_ref().and_then(|p| p.currency.clone()),
            "raw_price": raw.price.as_ref().map(|p| p.value.clone()),
        }),
    })
}

/// Pure normalization of one catalog product plus its merged price variant.
pub fn normalize_product(
    raw: &RawProduct,
    price: Option<&RawPrice>,
    group: &CatalogGroup,
    rules: &NormalizerRules,
) -> std::result::Result<CatalogProduct, SkipReason> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err(SkipReason::EmptyTitle);
    }
    if rules.is_denylisted(name) {
        return Err(SkipReason::DenylistedTitle);
    }

    let extended: std::collections::BTreeMap<String, String> = raw
        .extended_data
        .iter()
        .map(|e| (e.name.clone(), e.value.clone()))
        .collect();
    let card_number = extended
        .get("Number")
        .cloned()
        .or_else(|| rules.extract_card_number(name))
        .ok_or(SkipReason::MissingCardNumber)?;

    Ok(CatalogProduct {
        product_id: raw.product_id,
        category_id: if raw.category_id != 0 {
            raw.category_id
        } else {
            group.category_id
        },
        group_id: if raw.group_id != 0 {
            raw.group_id
        } else {
            group.group_id
        },
        name: name.to_string(),
        image_url: raw
            .image_url
            .as_deref()
            .map(|u| rules.upgrade_catalog_image(u)),
        set_name: Some(group.display_name.clone()),
        card_number: Some(card_number),
        rarity: extended.get("Rarity").cloned(),
        market_price: price.and_then(|p| p.market_price),
        low_price: price.and_then(|p| p.low_price),
        mid_price: price.and_then(|p| p.mid_price),
        high_price: price.and_then(|p| p.high_price),
        extended_attributes: extended,
        source_url: raw.url.clone(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_sets: Option<usize>,
    pub cards_per_set: Option<usize>,
    pub skip_sets: usize,
    pub max_api_calls: Option<u32>,
    pub per_search_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    BudgetExhausted { resume_skip_sets: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub groups_processed: usize,
    pub records_seen: usize,
    pub records_skipped: usize,
    pub records_written: u64,
    pub calls_made: u32,
    pub status: RunStatus,
}

impl RunSummary {
    /// The operator-facing resume contract: exactly how to continue the run.
    pub fn resume_hint(&self) -> Option<String> {
        match &self.status {
            RunStatus::Completed => None,
            RunStatus::BudgetExhausted { resume_skip_sets } => Some(format!(
                "call budget exhausted after {} calls; resume with --skip-sets={}",
                self.calls_made, resume_skip_sets
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradeTier {
    pub grader: String,
    pub grade: String,
}

pub fn default_grade_tiers() -> Vec<GradeTier> {
    [("PSA", "10"), ("PSA", "9"), ("BGS", "9.5"), ("CGC", "9.5")]
        .into_iter()
        .map(|(grader, grade)| GradeTier {
            grader: grader.to_string(),
            grade: grade.to_string(),
        })
        .collect()
}

pub struct PipelineOptions {
    pub call_delay: Duration,
    pub reports_dir: Option<PathBuf>,
    pub grade_tiers: Vec<GradeTier>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            call_delay: Duration::from_millis(500),
            reports_dir: None,
            grade_tiers: default_grade_tiers(),
        }
    }
}

/// Run controller. States: idle → running → completed | budget-exhausted;
/// setup failures surface as `Err` before any harvesting happens.
pub struct HarvestPipeline {
    catalog: Arc<dyn CatalogSource>,
    listings: Option<Arc<dyn ListingSource>>,
    sink: Arc<dyn RowSink>,
    budget: Arc<CallBudget>,
    rules: NormalizerRules,
    options: PipelineOptions,
}

impl HarvestPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        listings: Option<Arc<dyn ListingSource>>,
        sink: Arc<dyn RowSink>,
        budget: Arc<CallBudget>,
        rules: NormalizerRules,
        options: PipelineOptions,
    ) -> Self {
        Self {
            catalog,
            listings,
            sink,
            budget,
            rules,
            options,
        }
    }

    /// Harvests the catalog hierarchy: refresh group rows, then walk each
    /// selected group's products and price variants into product upserts.
    pub async fn run_catalog(&self, category_id: i64, opts: &RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, category_id, skip_sets = opts.skip_sets, "catalog harvest starting");

        let mut groups = self.catalog.list_groups(category_id).await;
        sort_groups_newest_first(&mut groups);

        let group_rows: Vec<JsonValue> = groups
            .iter()
            .map(|g| serde_json::to_value(parse_group(g, category_id)))
            .collect::<std::result::Result<_, _>>()
            .context("serializing group rows")?;
        let mut records_written = self
            .sink
            .upsert_rows(GROUPS_TABLE, GROUPS_CONFLICT_KEY, group_rows)
            .await;

        let selected: Vec<&RawGroup> = groups
            .iter()
            .skip(opts.skip_sets)
            .take(opts.max_sets.unwrap_or(usize::MAX))
            .collect();

        let mut status = RunStatus::Completed;
        let mut groups_processed = 0usize;
        let mut records_seen = 0usize;
        let mut records_skipped = 0usize;

        for (position, raw_group) in selected.into_iter().enumerate() {
            if self.budget.is_exhausted() {
                status = RunStatus::BudgetExhausted {
                    resume_skip_sets: opts.skip_sets + position,
                };
                break;
            }
            let group = parse_group(raw_group, category_id);
            debug!(group_id = group.group_id, set = %group.display_name, "walking group");

            let products = self
                .catalog
                .list_products(category_id, group.group_id)
                .await;
            tokio::time::sleep(self.options.call_delay).await;
            // Upserts are full-row replace, so a group is only written when its
            // price unit was actually fetched; a gated or failed price fetch
            // defers the whole group instead of overwriting priced rows with
            // price-less ones.
            if self.budget.is_exhausted() {
                status = RunStatus::BudgetExhausted {
                    resume_skip_sets: opts.skip_sets + position,
                };
                break;
            }
            let Some(prices) = self.catalog.list_prices(category_id, group.group_id).await
            else {
                if self.budget.is_exhausted() {
                    status = RunStatus::BudgetExhausted {
                        resume_skip_sets: opts.skip_sets + position,
                    };
                    break;
                }
                warn!(
                    group_id = group.group_id,
                    set = %group.display_name,
                    "price unit unavailable, deferring group"
                );
                tokio::time::sleep(self.options.call_delay).await;
                continue;
            };
            let merged = merge_prices(prices, &self.rules.variant_preference);

            let mut rows = Vec::with_capacity(products.len());
            for product in &products {
                records_seen += 1;
                match normalize_product(
                    product,
                    merged.get(&product.product_id),
                    &group,
                    &self.rules,
                ) {
                    Ok(row) => rows.push(
                        serde_json::to_value(row).context("serializing product row")?,
                    ),
                    Err(reason) => {
                        records_skipped += 1;
                        debug!(product = %product.name, ?reason, "record excluded");
                    }
                }
            }
            let written = self
                .sink
                .upsert_rows(PRODUCTS_TABLE, PRODUCTS_CONFLICT_KEY, rows)
                .await;
            info!(
                group_id = group.group_id,
                set = %group.display_name,
                products = products.len(),
                written,
                "group harvested"
            );
            records_written += written;
            groups_processed += 1;
            tokio::time::sleep(self.options.call_delay).await;
        }

        let summary = RunSummary {
            run_id,
            kind: "catalog".to_string(),
            started_at,
            finished_at: Utc::now(),
            groups_processed,
            records_seen,
            records_skipped,
            records_written,
            calls_made: self.budget.calls_made(),
            status,
        };
        self.finish(&summary).await;
        Ok(summary)
    }

    /// Harvests graded listings: for each selected group, take the leading
    /// cards and run one search per configured grade tier.
    pub async fn run_listings(&self, category_id: i64, opts: &RunOptions) -> Result<RunSummary> {
        let listings = self
            .listings
            .as_ref()
            .context("listing source not configured")?
            .clone();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cards_per_set = opts.cards_per_set.unwrap_or(3);
        let per_search_limit = opts.per_search_limit.unwrap_or(10);
        info!(%run_id, category_id, skip_sets = opts.skip_sets, "listings harvest starting");

        let mut groups = self.catalog.list_groups(category_id).await;
        sort_groups_newest_first(&mut groups);
        let selected: Vec<&RawGroup> = groups
            .iter()
            .skip(opts.skip_sets)
            .take(opts.max_sets.unwrap_or(usize::MAX))
            .collect();

        let mut status = RunStatus::Completed;
        let mut groups_processed = 0usize;
        let mut records_seen = 0usize;
        let mut records_skipped = 0usize;
        let mut records_written = 0u64;

        'groups: for raw_group in selected {
            if self.budget.is_exhausted() {
                status = RunStatus::BudgetExhausted {
                    resume_skip_sets: opts.skip_sets + groups_processed,
                };
                break;
            }
            let group = parse_group(raw_group, category_id);
            let products = self
                .catalog
                .list_products(category_id, group.group_id)
                .await;
            let mut rows = Vec::new();

            for product in products.iter().take(cards_per_set) {
                for tier in &self.options.grade_tiers {
                    if self.budget.is_exhausted() {
                        status = RunStatus::BudgetExhausted {
                            resume_skip_sets: opts.skip_sets + groups_processed,
                        };
                        records_written += self
                            .sink
                            .upsert_rows(LISTINGS_TABLE, LISTINGS_CONFLICT_KEY, rows)
                            .await;
                        break 'groups;
                    }
                    let query = format!(
                        "{} {} {} {}",
                        product.name, group.display_name, tier.grader, tier.grade
                    );
                    let items = listings.search(&query, per_search_limit).await;
                    for item in &items {
                        records_seen += 1;
                        match normalize_listing(item, Some(&group.display_name), &self.rules) {
                            Ok(listing) => rows.push(
                                serde_json::to_value(listing)
                                    .context("serializing listing row")?,
                            ),
                            Err(reason) => {
                                records_skipped += 1;
                                debug!(query = %query, title = %item.title, ?reason, "record excluded");
                            }
                        }
                    }
                    tokio::time::sleep(self.options.call_delay).await;
                }
            }

            let written = self
                .sink
                .upsert_rows(LISTINGS_TABLE, LISTINGS_CONFLICT_KEY, rows)
                .await;
            info!(
                group_id = group.group_id,
                set = %group.display_name,
                written,
                "group searched"
            );
            records_written += written;
            groups_processed += 1;
        }

        let summary = RunSummary {
            run_id,
            kind: "listings".to_string(),
            started_at,
            finished_at: Utc::now(),
            groups_processed,
            records_seen,
            records_skipped,
            records_written,
            calls_made: self.budget.calls_made(),
            status,
        };
        self.finish(&summary).await;
        Ok(summary)
    }

    async fn finish(&self, summary: &RunSummary) {
        info!(
            run_id = %summary.run_id,
            kind = %summary.kind,
            groups = summary.groups_processed,
            seen = summary.records_seen,
            skipped = summary.records_skipped,
            written = summary.records_written,
            calls = summary.calls_made,
            "harvest run finished"
        );
        if let Some(hint) = summary.resume_hint() {
            warn!("{hint}");
        }
        if let Err(err) = self.write_report(summary).await {
            warn!(error = %err, "failed to write run report");
        }
    }

    async fn write_report(&self, summary: &RunSummary) -> Result<()> {
        let Some(reports_dir) = &self.options.reports_dir else {
            return Ok(());
        };
        let dir = reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let bytes =
            serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        let path = dir.join("harvest_summary.json");
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn budget_for(opts: &RunOptions) -> Arc<CallBudget> {
    Arc::new(match opts.max_api_calls {
        Some(limit) => CallBudget::limited(limit),
        None => CallBudget::unlimited(),
    })
}

fn artifacts_for(config: &HarvestConfig) -> Option<Arc<ArtifactStore>> {
    config
        .artifacts_dir
        .as_ref()
        .map(|dir| Arc::new(ArtifactStore::new(dir.clone())))
}

/// Builds and runs a catalog harvest from environment configuration.
pub async fn run_catalog_from_env(category_id: i64, opts: RunOptions) -> Result<RunSummary> {
    let config = HarvestConfig::from_env();
    let budget = budget_for(&opts);
    let fetcher = Arc::new(RateLimitedFetcher::new(
        FetcherConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        },
        budget.clone(),
    )?);
    let catalog = Arc::new(HttpCatalogSource::new(
        fetcher,
        config.catalog_base.clone(),
        artifacts_for(&config),
    ));
    let sink = Arc::new(UpsertStore::new(UpsertStoreConfig::new(
        config.store_url.clone(),
        config.store_key.clone(),
    ))?);
    let rules = NormalizerRules::compile(&RulesSpec::default())?;
    let pipeline = HarvestPipeline::new(
        catalog,
        None,
        sink,
        budget,
        rules,
        PipelineOptions {
            call_delay: config.call_delay,
            reports_dir: config.reports_dir.clone(),
            grade_tiers: default_grade_tiers(),
        },
    );
    pipeline.run_catalog(category_id, &opts).await
}

/// Builds and runs a graded-listings harvest from environment configuration.
/// Authenticates up front: credential problems abort before any harvesting.
pub async fn run_listings_from_env(category_id: i64, opts: RunOptions) -> Result<RunSummary> {
    let config = HarvestConfig::from_env();
    let budget = budget_for(&opts);
    let fetcher = Arc::new(RateLimitedFetcher::new(
        FetcherConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        },
        budget.clone(),
    )?);
    let auth = SearchAuth::new(
        fetcher.http_client(),
        config.token_url.clone(),
        config.app_id.clone(),
        config.app_secret.clone(),
        config.oauth_scope.clone(),
    )?;
    auth.bearer_token()
        .await
        .context("initial token exchange failed")?;

    let artifacts = artifacts_for(&config);
    let catalog = Arc::new(HttpCatalogSource::new(
        fetcher.clone(),
        config.catalog_base.clone(),
        artifacts.clone(),
    ));
    let listings = Arc::new(HttpListingSource::new(
        fetcher,
        auth,
        config.search_base.clone(),
        artifacts,
    ));
    let sink = Arc::new(UpsertStore::new(UpsertStoreConfig::new(
        config.store_url.clone(),
        config.store_key.clone(),
    ))?);
    let rules = NormalizerRules::compile(&RulesSpec::default())?;
    let pipeline = HarvestPipeline::new(
        catalog,
        Some(listings),
        sink,
        budget,
        rules,
        PipelineOptions {
            call_delay: config.call_delay,
            reports_dir: config.reports_dir.clone(),
            grade_tiers: default_grade_tiers(),
        },
    );
    pipeline.run_listings(category_id, &opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cardfeed_adapters::{RawExtendedData, RawImage, RawMoney};
    use std::collections::{BTreeMap, HashSet};
    use tokio::sync::Mutex;

    fn rules() -> NormalizerRules {
        NormalizerRules::compile(&RulesSpec::default()).unwrap()
    }

    #[test]
    fn grading_extraction_matches_spec_cases() {
        let rules = rules();
        assert_eq!(
            rules.extract_grading("PSA 10 Charizard Base Set"),
            Some(("PSA".to_string(), "10".to_string()))
        );
        assert_eq!(
            rules.extract_grading("BGS 9.5 Messi Rookie"),
            Some(("BGS".to_string(), "9.5".to_string()))
        );
        assert_eq!(rules.extract_grading("Raw Ungraded Pikachu"), None);
        // Lowercase and punctuation variants still match.
        assert_eq!(
            rules.extract_grading("cgc-9.5 gem mint"),
            Some(("CGC".to_string(), "9.5".to_string()))
        );
    }

    #[test]
    fn grading_extraction_is_deterministic() {
        let rules = rules();
        let title = "SGC 10 1999 Charizard Holo #4";
        assert_eq!(rules.extract_grading(title), rules.extract_grading(title));
        assert_eq!(
            rules.extract_card_number(title),
            rules.extract_card_number(title)
        );
    }

    #[test]
    fn card_number_extraction_matches_spec_cases() {
        let rules = rules();
        assert_eq!(
            rules.extract_card_number("Charizard 223/191"),
            Some("223/191".to_string())
        );
        assert_eq!(rules.extract_card_number("Card #025"), Some("025".to_string()));
        assert_eq!(rules.extract_card_number("random text no number"), None);
    }

    #[test]
    fn card_number_set_code_skips_grader_tokens() {
        let rules = rules();
        assert_eq!(
            rules.extract_card_number("Pikachu VMAX SWSH286 Promo"),
            Some("SWSH286".to_string())
        );
        // "PSA10" looks like a set code but is a grader plus grade.
        assert_eq!(rules.extract_card_number("PSA10 Charizard Holo"), None);
    }

    #[test]
    fn year_extraction_takes_first_plausible_token() {
        let rules = rules();
        assert_eq!(rules.extract_year("1999 Pokemon Base Set Charizard"), Some(1999));
        assert_eq!(rules.extract_year("2024 Topps Chrome"), Some(2024));
        assert_eq!(rules.extract_year("Charizard 223/191"), None);
    }

    #[test]
    fn image_upgrade_rewrites_known_tokens_only() {
        let rules = rules();
        assert_eq!(
            rules.upgrade_listing_image("https://i.example.com/images/g123/s-l225.jpg"),
            "https://i.example.com/images/g123/s-l1600.jpg"
        );
        assert_eq!(
            rules.upgrade_catalog_image("https://cdn.example.com/product/610481_200w.jpg"),
            "https://cdn.example.com/product/610481_400w.jpg"
        );
        let unknown = "https://cdn.example.com/product/610481_full.jpg";
        assert_eq!(rules.upgrade_catalog_image(unknown), unknown);
    }

    #[test]
    fn cents_conversion_rounds_half_up() {
        assert_eq!(dollars_to_cents(499.99), 49999);
        assert_eq!(dollars_to_cents(10.0), 1000);
        assert_eq!(dollars_to_cents(0.125), 13);
        assert_eq!(dollars_to_cents(0.0), 0);
    }

    fn price(product_id: i64, sub_type: &str, market: f64) -> RawPrice {
        RawPrice {
            product_id,
            sub_type_name: sub_type.to_string(),
            market_price: Some(market),
            low_price: None,
            mid_price: None,
            high_price: None,
        }
    }

    #[test]
    fn price_merge_prefers_normal_variant_regardless_of_order() {
        let preference = vec!["Normal".to_string()];
        let forward = merge_prices(
            vec![price(1, "Foil", 50.0), price(1, "Normal", 40.0)],
            &preference,
        );
        assert_eq!(forward[&1].market_price, Some(40.0));

        let reversed = merge_prices(
            vec![price(1, "Normal", 40.0), price(1, "Foil", 50.0)],
            &preference,
        );
        assert_eq!(reversed[&1].market_price, Some(40.0));
    }

    #[test]
    fn price_merge_falls_back_to_first_seen_for_unknown_vocabulary() {
        let preference = vec!["Normal".to_string()];
        let merged = merge_prices(
            vec![price(2, "Holofoil", 12.0), price(2, "Reverse Holofoil", 9.0)],
            &preference,
        );
        assert_eq!(merged[&2].market_price, Some(12.0));
    }

    fn listing_item(id: &str, title: &str, price_value: Option<&str>) -> RawItemSummary {
        RawItemSummary {
            item_id: id.to_string(),
            title: title.to_string(),
            image: Some(RawImage {
                image_url: "https://i.example.com/images/s-l225.jpg".to_string(),
            }),
            price: price_value.map(|v| RawMoney {
                value: v.to_string(),
                currency: Some("USD".to_string()),
            }),
            item_web_url: Some("https://www.example.com/itm/1".to_string()),
            condition: Some("Used".to_string()),
        }
    }

    #[test]
    fn ungraded_listings_are_dropped() {
        let rules = rules();
        let graded = listing_item("v1|1|0", "PSA 10 Charizard Base Set 4/102", Some("499.99"));
        let ungraded = listing_item("v1|2|0", "Raw Ungraded Pikachu", Some("5.00"));

        let normalized = normalize_listing(&graded, Some("Base Set"), &rules).unwrap();
        assert_eq!(normalized.grader, "PSA");
        assert_eq!(normalized.grade, "10");
        assert_eq!(normalized.price_cents, 49999);
        assert_eq!(normalized.card_number.as_deref(), Some("4/102"));
        assert_eq!(
            normalized.image_url.as_deref(),
            Some("https://i.example.com/images/s-l1600.jpg")
        );

        assert_eq!(
            normalize_listing(&ungraded, None, &rules),
            Err(SkipReason::MissingGrading)
        );
    }

    #[test]
    fn denylisted_and_unpriced_listings_are_dropped() {
        let rules = rules();
        let bulk = listing_item("v1|3|0", "PSA 10 Charizard lot of 5 sealed", Some("100.00"));
        assert_eq!(
            normalize_listing(&bulk, None, &rules),
            Err(SkipReason::DenylistedTitle)
        );
        let unpriced = listing_item("v1|4|0", "PSA 10 Charizard Base Set", None);
        assert_eq!(
            normalize_listing(&unpriced, None, &rules),
            Err(SkipReason::MissingPrice)
        );
    }

    fn product(product_id: i64, name: &str, number: Option<&str>) -> RawProduct {
        RawProduct {
            product_id,
            category_id: 3,
            group_id: 0,
            name: name.to_string(),
            image_url: Some(format!(
                "https://cdn.example.com/product/{product_id}_200w.jpg"
            )),
            url: Some(format!("https://market.example.com/product/{product_id}")),
            extended_data: number
                .map(|n| {
                    vec![RawExtendedData {
                        name: "Number".to_string(),
                        value: n.to_string(),
                    }]
                })
                .unwrap_or_default(),
        }
    }

    fn group(group_id: i64, name: &str, published_on: &str) -> RawGroup {
        RawGroup {
            group_id,
            category_id: 3,
            name: name.to_string(),
            abbreviation: None,
            published_on: Some(published_on.to_string()),
            modified_on: None,
        }
    }

    #[test]
    fn product_without_card_number_is_excluded() {
        let rules = rules();
        let g = parse_group(&group(7, "Surging Sparks", "2024-11-08T00:00:00"), 3);
        let ok = normalize_product(&product(1, "Pikachu ex", Some("238/191")), None, &g, &rules);
        assert!(ok.is_ok());
        let missing = normalize_product(&product(2, "Energy Card", None), None, &g, &rules);
        assert_eq!(missing, Err(SkipReason::MissingCardNumber));
    }

    #[test]
    fn groups_sort_newest_first_with_stable_tiebreak() {
        let mut groups = vec![
            group(1, "Old", "2023-01-01T00:00:00"),
            group(3, "New", "2024-11-08T00:00:00"),
            group(2, "Mid", "2024-01-01T00:00:00"),
            group(4, "Also New", "2024-11-08T00:00:00"),
        ];
        sort_groups_newest_first(&mut groups);
        let ids: Vec<i64> = groups.iter().map(|g| g.group_id).collect();
        assert_eq!(ids, vec![4, 3, 2, 1]);
    }

    /// In-memory keyed store mirroring the upsert contract: full-row replace
    /// on the conflict key.
    struct MemorySink {
        tables: Mutex<HashMap<String, BTreeMap<String, JsonValue>>>,
        upsert_calls: Mutex<HashMap<String, usize>>,
    }

    impl MemorySink {
        fn new() -> Self {
            Self {
                tables: Mutex::new(HashMap::new()),
                upsert_calls: Mutex::new(HashMap::new()),
            }
        }

        async fn rows(&self, table: &str) -> Vec<JsonValue> {
            self.tables
                .lock()
                .await
                .get(table)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        }

        async fn calls(&self, table: &str) -> usize {
            *self.upsert_calls.lock().await.get(table).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl RowSink for MemorySink {
        async fn upsert_rows(
            &self,
            table: &str,
            conflict_key: &str,
            rows: Vec<JsonValue>,
        ) -> u64 {
            *self
                .upsert_calls
                .lock()
                .await
                .entry(table.to_string())
                .or_default() += 1;
            if rows.is_empty() {
                return 0;
            }
            let mut tables = self.tables.lock().await;
            let entries = tables.entry(table.to_string()).or_default();
            let mut written = 0u64;
            for row in rows {
                let Some(key) = row.get(conflict_key).map(|k| k.to_string()) else {
                    continue;
                };
                entries.insert(key, row);
                written += 1;
            }
            written
        }
    }

    /// In-memory catalog honoring the walker contract: gate on the shared
    /// budget before each call, record one call per fetch.
    struct MockCatalog {
        budget: Arc<CallBudget>,
        groups: Vec<RawGroup>,
        products: HashMap<i64, Vec<RawProduct>>,
        prices: HashMap<i64, Vec<RawPrice>>,
        failing_groups: HashSet<i64>,
        price_outages: HashSet<i64>,
    }

    #[async_trait]
    impl CatalogSource for MockCatalog {
        async fn list_groups(&self, _category_id: i64) -> Vec<RawGroup> {
            if self.budget.is_exhausted() {
                return Vec::new();
            }
            self.budget.record_call();
            self.groups.clone()
        }

        async fn list_products(&self, _category_id: i64, group_id: i64) -> Vec<RawProduct> {
            if self.budget.is_exhausted() {
                return Vec::new();
            }
            self.budget.record_call();
            if self.failing_groups.contains(&group_id) {
                return Vec::new();
            }
            self.products.get(&group_id).cloned().unwrap_or_default()
        }

        async fn list_prices(&self, _category_id: i64, group_id: i64) -> Option<Vec<RawPrice>> {
            if self.budget.is_exhausted() {
                return None;
            }
            self.budget.record_call();
            if self.price_outages.contains(&group_id) {
                return None;
            }
            if self.failing_groups.contains(&group_id) {
                return Some(Vec::new());
            }
            Some(self.prices.get(&group_id).cloned().unwrap_or_default())
        }
    }

    fn scenario_catalog(
        budget: Arc<CallBudget>,
        group_count: i64,
        failing_groups: HashSet<i64>,
    ) -> MockCatalog {
        let mut groups = Vec::new();
        let mut products = HashMap::new();
        let mut prices = HashMap::new();
        for gid in 1..=group_count {
            groups.push(group(
                gid,
                &format!("Set {gid}"),
                // Later group ids published later, so sorted order is
                // descending by id and resume offsets are predictable.
                &format!("2024-01-{:02}T00:00:00", gid),
            ));
            let pid = gid * 100;
            products.insert(
                gid,
                vec![product(pid, &format!("Card {pid}"), Some("10/100"))],
            );
            prices.insert(gid, vec![price(pid, "Normal", 25.0)]);
        }
        MockCatalog {
            budget,
            groups,
            products,
            prices,
            failing_groups,
            price_outages: HashSet::new(),
        }
    }

    fn pipeline(catalog: MockCatalog, sink: Arc<MemorySink>, budget: Arc<CallBudget>) -> HarvestPipeline {
        HarvestPipeline::new(
            Arc::new(catalog),
            None,
            sink,
            budget,
            rules(),
            PipelineOptions {
                call_delay: Duration::from_millis(0),
                reports_dir: None,
                grade_tiers: default_grade_tiers(),
            },
        )
    }

    #[tokio::test]
    async fn budget_gate_stops_after_exact_call_count_with_resume_offset() {
        // 4 groups need 1 + 4*2 = 9 calls; a budget of 5 covers the group
        // list plus two full groups.
        let budget = Arc::new(CallBudget::limited(5));
        let sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(budget.clone(), 4, HashSet::new());
        let pipeline = pipeline(catalog, sink.clone(), budget.clone());

        let summary = pipeline
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.calls_made, 5);
        assert_eq!(
            summary.status,
            RunStatus::BudgetExhausted {
                resume_skip_sets: 2
            }
        );
        assert_eq!(summary.groups_processed, 2);
        assert!(summary.resume_hint().unwrap().contains("--skip-sets=2"));
        // Groups are walked newest-first: ids 4 and 3 were harvested.
        let written: HashSet<i64> = sink
            .rows(PRODUCTS_TABLE)
            .await
            .iter()
            .map(|r| r["group_id"].as_i64().unwrap())
            .collect();
        assert_eq!(written, HashSet::from([4, 3]));
    }

    #[tokio::test]
    async fn resume_offset_produces_zero_overlap() {
        let first_budget = Arc::new(CallBudget::limited(5));
        let first_sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(first_budget.clone(), 4, HashSet::new());
        let summary = pipeline(catalog, first_sink.clone(), first_budget)
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();
        let RunStatus::BudgetExhausted { resume_skip_sets } = summary.status else {
            panic!("expected budget exhaustion");
        };

        let resumed_budget = Arc::new(CallBudget::unlimited());
        let resumed_sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(resumed_budget.clone(), 4, HashSet::new());
        let resumed = pipeline(catalog, resumed_sink.clone(), resumed_budget)
            .run_catalog(
                3,
                &RunOptions {
                    skip_sets: resume_skip_sets,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);

        let first_groups: HashSet<i64> = first_sink
            .rows(PRODUCTS_TABLE)
            .await
            .iter()
            .map(|r| r["group_id"].as_i64().unwrap())
            .collect();
        let resumed_groups: HashSet<i64> = resumed_sink
            .rows(PRODUCTS_TABLE)
            .await
            .iter()
            .map(|r| r["group_id"].as_i64().unwrap())
            .collect();
        assert!(first_groups.is_disjoint(&resumed_groups));
        let mut all: Vec<i64> = first_groups.union(&resumed_groups).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn gated_price_fetch_leaves_existing_rows_intact_and_resumes_on_group() {
        // list_groups plus the newest group's products consume the whole
        // budget, so the price unit would be gated.
        let budget = Arc::new(CallBudget::limited(2));
        let sink = Arc::new(MemorySink::new());
        sink.upsert_rows(
            PRODUCTS_TABLE,
            PRODUCTS_CONFLICT_KEY,
            vec![serde_json::json!({"product_id": 200, "group_id": 2, "market_price": 25.0})],
        )
        .await;
        let catalog = scenario_catalog(budget.clone(), 2, HashSet::new());
        let summary = pipeline(catalog, sink.clone(), budget)
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.calls_made, 2);
        assert_eq!(summary.groups_processed, 0);
        // Resume points back at the deferred group, not past it.
        assert_eq!(
            summary.status,
            RunStatus::BudgetExhausted {
                resume_skip_sets: 0
            }
        );
        let rows = sink.rows(PRODUCTS_TABLE).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["market_price"].as_f64(), Some(25.0));
    }

    #[tokio::test]
    async fn unavailable_price_unit_defers_group_without_clobbering_rows() {
        let budget = Arc::new(CallBudget::unlimited());
        let sink = Arc::new(MemorySink::new());
        sink.upsert_rows(
            PRODUCTS_TABLE,
            PRODUCTS_CONFLICT_KEY,
            vec![serde_json::json!({"product_id": 200, "group_id": 2, "market_price": 77.0})],
        )
        .await;
        let mut catalog = scenario_catalog(budget.clone(), 3, HashSet::new());
        catalog.price_outages.insert(2);
        let summary = pipeline(catalog, sink.clone(), budget)
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.groups_processed, 2);
        let rows = sink.rows(PRODUCTS_TABLE).await;
        let group2: Vec<&JsonValue> = rows
            .iter()
            .filter(|r| r["group_id"].as_i64() == Some(2))
            .collect();
        assert_eq!(group2.len(), 1);
        assert_eq!(group2[0]["market_price"].as_f64(), Some(77.0));
        for gid in [1, 3] {
            assert!(rows.iter().any(|r| r["group_id"].as_i64() == Some(gid)));
        }
    }

    #[tokio::test]
    async fn failed_group_does_not_abort_siblings() {
        let budget = Arc::new(CallBudget::unlimited());
        let sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(budget.clone(), 10, HashSet::from([3]));
        let summary = pipeline(catalog, sink.clone(), budget)
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.groups_processed, 10);
        let written: HashSet<i64> = sink
            .rows(PRODUCTS_TABLE)
            .await
            .iter()
            .map(|r| r["group_id"].as_i64().unwrap())
            .collect();
        assert_eq!(written.len(), 9);
        assert!(!written.contains(&3));
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let sink = MemorySink::new();
        let row = serde_json::json!({
            "product_id": 610481,
            "name": "Pikachu ex",
            "market_price": 92.34,
        });
        let first = sink
            .upsert_rows(PRODUCTS_TABLE, PRODUCTS_CONFLICT_KEY, vec![row.clone()])
            .await;
        let snapshot = sink.rows(PRODUCTS_TABLE).await;
        let second = sink
            .upsert_rows(PRODUCTS_TABLE, PRODUCTS_CONFLICT_KEY, vec![row])
            .await;
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(sink.rows(PRODUCTS_TABLE).await, snapshot);
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn end_to_end_catalog_scenario_writes_five_of_six_rows() {
        let budget = Arc::new(CallBudget::unlimited());
        let sink = Arc::new(MemorySink::new());

        let groups = vec![
            group(1, "Base Set", "1999-01-09T00:00:00"),
            group(2, "Jungle", "1999-06-16T00:00:00"),
        ];
        let mut products = HashMap::new();
        let mut prices = HashMap::new();
        products.insert(
            1,
            vec![
                product(101, "Charizard", Some("4/102")),
                product(102, "Blastoise", Some("2/102")),
                // No number in extended data and none in the name.
                product(103, "Trainer Card", None),
            ],
        );
        prices.insert(
            1,
            vec![
                price(101, "Normal", 400.0),
                price(101, "Foil", 900.0),
                price(102, "Normal", 150.0),
            ],
        );
        products.insert(
            2,
            vec![
                product(201, "Snorlax", Some("11/64")),
                product(202, "Scyther", Some("10/64")),
                product(203, "Vaporeon", Some("12/64")),
            ],
        );
        prices.insert(2, vec![price(201, "Normal", 30.0)]);

        let catalog = MockCatalog {
            budget: budget.clone(),
            groups,
            products,
            prices,
            failing_groups: HashSet::new(),
            price_outages: HashSet::new(),
        };
        let summary = pipeline(catalog, sink.clone(), budget)
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.records_seen, 6);
        assert_eq!(summary.records_skipped, 1);
        // Group rows are refreshed in a single sync call per run.
        assert_eq!(sink.calls(GROUPS_TABLE).await, 1);
        assert_eq!(sink.rows(GROUPS_TABLE).await.len(), 2);

        let rows = sink.rows(PRODUCTS_TABLE).await;
        assert_eq!(rows.len(), 5);
        // Dedup preferred the Normal variant for Charizard.
        let charizard = rows
            .iter()
            .find(|r| r["product_id"].as_i64() == Some(101))
            .unwrap();
        assert_eq!(charizard["market_price"].as_f64(), Some(400.0));
        // Every product with a price variant carries a market price.
        for pid in [101, 102, 201] {
            let row = rows
                .iter()
                .find(|r| r["product_id"].as_i64() == Some(pid))
                .unwrap();
            assert!(row["market_price"].as_f64().is_some());
        }
    }

    /// Listing source honoring the same gate-then-count contract.
    struct MockListings {
        budget: Arc<CallBudget>,
        items: Vec<RawItemSummary>,
    }

    #[async_trait]
    impl ListingSource for MockListings {
        async fn search(&self, _query: &str, _limit: u32) -> Vec<RawItemSummary> {
            if self.budget.is_exhausted() {
                return Vec::new();
            }
            self.budget.record_call();
            self.items.clone()
        }
    }

    #[tokio::test]
    async fn listings_run_persists_only_graded_items() {
        let budget = Arc::new(CallBudget::unlimited());
        let sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(budget.clone(), 1, HashSet::new());
        let listings = MockListings {
            budget: budget.clone(),
            items: vec![
                listing_item("v1|10|0", "PSA 10 Card 100 Set 1 4/102", Some("120.00")),
                listing_item("v1|11|0", "Raw Ungraded Card 100", Some("8.00")),
            ],
        };
        let pipeline = HarvestPipeline::new(
            Arc::new(catalog),
            Some(Arc::new(listings)),
            sink.clone(),
            budget,
            rules(),
            PipelineOptions {
                call_delay: Duration::from_millis(0),
                reports_dir: None,
                grade_tiers: vec![GradeTier {
                    grader: "PSA".to_string(),
                    grade: "10".to_string(),
                }],
            },
        );

        let summary = pipeline
            .run_listings(3, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Completed);

        let rows = sink.rows(LISTINGS_TABLE).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ebay_item_id"].as_str(), Some("v1|10|0"));
        assert_eq!(rows[0]["grader"].as_str(), Some("PSA"));
        assert_eq!(rows[0]["price_cents"].as_i64(), Some(12000));
        assert_eq!(rows[0]["set_name"].as_str(), Some("Set 1"));
    }

    #[tokio::test]
    async fn run_report_is_written_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(CallBudget::unlimited());
        let sink = Arc::new(MemorySink::new());
        let catalog = scenario_catalog(budget.clone(), 1, HashSet::new());
        let pipeline = HarvestPipeline::new(
            Arc::new(catalog),
            None,
            sink,
            budget,
            rules(),
            PipelineOptions {
                call_delay: Duration::from_millis(0),
                reports_dir: Some(dir.path().to_path_buf()),
                grade_tiers: default_grade_tiers(),
            },
        );
        let summary = pipeline
            .run_catalog(3, &RunOptions::default())
            .await
            .unwrap();

        let report_path = dir
            .path()
            .join(summary.run_id.to_string())
            .join("harvest_summary.json");
        let text = std::fs::read_to_string(report_path).unwrap();
        let value: JsonValue = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"].as_str(), Some("catalog"));
        assert_eq!(value["status"]["state"].as_str(), Some("completed"));
    }
}
