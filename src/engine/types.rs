use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    Model,
    Symbol,
    Backdrop,
    Other(String),
}

impl AttributeKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "model" => AttributeKind::Model,
            "symbol" => AttributeKind::Symbol,
            "backdrop" => AttributeKind::Backdrop,
            _ => AttributeKind::Other(raw.trim().to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AttributeKind::Model => "Model",
            AttributeKind::Symbol => "Symbol",
            AttributeKind::Backdrop => "Backdrop",
            AttributeKind::Other(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: AttributeKind,
    pub value: String,
    pub rarity_per_mille: i64,
}

/// One purchase as returned by the marketplace, parsed once at ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct SaleEvent {
    pub action_id: String,
    pub collectible_id: String,
    pub name: String,
    pub external_number: i64,
    pub amount: Decimal,
    pub floor_price: Decimal,
    /// Raw ISO-8601 string exactly as the API sent it.
    pub created_at: String,
    pub attributes: Vec<Attribute>,
}

impl SaleEvent {
    pub fn synth_action_id(collectible_id: &str, created_at: &str, amount: &Decimal) -> String {
        format!("{collectible_id}_{created_at}_{amount}")
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_ts_utc(&self.created_at)
    }

    pub fn attribute(&self, kind: &AttributeKind) -> Option<&Attribute> {
        self.attributes.iter().find(|a| &a.kind == kind)
    }

    /// `<family-name-no-spaces>-<external_number>`, the t.me/nft path segment.
    pub fn link_slug(&self) -> String {
        let compact: String = self.name.chars().filter(|c| !c.is_whitespace()).collect();
        format!("{compact}-{}", self.external_number)
    }
}

/// Per-collectible memory kept by the price tracker and persisted in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub price: Decimal,
    pub timestamp: String,
    pub action_id: String,
    pub name: String,
    pub external_number: i64,
}

impl PriceRecord {
    pub fn from_event(event: &SaleEvent) -> Self {
        Self {
            price: event.amount,
            timestamp: event.created_at.clone(),
            action_id: event.action_id.clone(),
            name: event.name.clone(),
            external_number: event.external_number,
        }
    }
}

/// RFC 3339 first; offset-less timestamps are read as UTC.
pub fn parse_ts_utc(s: &str) -> Option<DateTime<Utc>> {
    let raw = s.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
