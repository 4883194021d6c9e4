//! Core domain rows and shared run-budget state for cardfeed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cardfeed-core";

/// A source-defined release batch ("set") of products.
///
/// Groups are refreshed on every harvest run and never deleted by the
/// pipeline; a group that disappears upstream simply stops being refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogGroup {
    pub group_id: i64,
    pub category_id: i64,
    pub display_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Canonical catalog product row. `product_id` is the conflict key; every
/// re-harvest replaces all mutable fields (full upsert, not patch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub product_id: i64,
    pub category_id: i64,
    pub group_id: i64,
    pub name: String,
    pub image_url: Option<String>,
    pub set_name: Option<String>,
    pub card_number: Option<String>,
    pub rarity: Option<String>,
    pub market_price: Option<f64>,
    pub low_price: Option<f64>,
    pub mid_price: Option<f64>,
    pub high_price: Option<f64>,
    #[serde(default)]
    pub extended_attributes: BTreeMap<String, String>,
    pub source_url: Option<String>,
}

/// Canonical graded-listing row from the search source. `ebay_item_id` is the
/// idempotency key; grader and grade are both mandatory — ungraded listings
/// never reach the store. Prices are integer minor units (cents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedListing {
    pub ebay_item_id: String,
    pub title: String,
    pub image_url: Option<String>,
    pub price_cents: i64,
    pub grader: String,
    pub grade: String,
    pub set_name: Option<String>,
    pub year: Option<i32>,
    pub card_number: Option<String>,
    pub source_metadata: serde_json::Value,
}

/// Shared external-call budget for one harvest run.
///
/// This is the only shared mutable state in the pipeline: the fetcher records
/// every attempt, the walkers and the run controller read it as a hard
/// backpressure gate. Explicit state object instead of a process-wide global
/// so tests can thread their own counter through every component.
#[derive(Debug)]
pub struct CallBudget {
    limit: Option<u32>,
    made: AtomicU32,
}

impl CallBudget {
    pub fn limited(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            made: AtomicU32::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: None,
            made: AtomicU32::new(0),
        }
    }

    /// Records one external call attempt and returns the new total.
    pub fn record_call(&self) -> u32 {
        self.made.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn calls_made(&self) -> u32 {
        self.made.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Hard gate consulted before issuing a call. Exhausted means "do not
    /// call", not "retry later".
    pub fn is_exhausted(&self) -> bool {
        match self.limit {
            Some(limit) => self.calls_made() >= limit,
            None => false,
        }
    }

    pub fn remaining(&self) -> Option<u32> {
        self.limit
            .map(|limit| limit.saturating_sub(self.calls_made()))
    }
}
