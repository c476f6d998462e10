use crate::engine::types::{parse_ts_utc, PriceRecord, SaleEvent};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleVerdict {
    New,
    Duplicate,
    /// Same family/number, near-identical price and time, different collectible id.
    NearDuplicate,
    PriceChange,
}

impl SaleVerdict {
    /// `(is_duplicate, is_price_change)`
    pub fn flags(self) -> (bool, bool) {
        match self {
            SaleVerdict::New => (false, false),
            SaleVerdict::Duplicate | SaleVerdict::NearDuplicate => (true, false),
            SaleVerdict::PriceChange => (false, true),
        }
    }

    pub fn is_duplicate(self) -> bool {
        self.flags().0
    }
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub price_epsilon: Decimal,
    pub retention: Duration,
    pub similar_window: Duration,
}

/// Price history keyed by collectible id.
#[derive(Debug)]
pub struct PriceTracker {
    settings: DedupSettings,
    history: BTreeMap<String, PriceRecord>,
}

impl PriceTracker {
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            settings,
            history: BTreeMap::new(),
        }
    }

    pub fn from_records(settings: DedupSettings, records: BTreeMap<String, PriceRecord>) -> Self {
        Self {
            settings,
            history: records,
        }
    }

    pub fn classify(&self, event: &SaleEvent) -> SaleVerdict {
        let eps = self.settings.price_epsilon;

        if let Some(prev) = self.history.get(&event.collectible_id) {
            return if (event.amount - prev.price).abs() < eps {
                SaleVerdict::Duplicate
            } else {
                SaleVerdict::PriceChange
            };
        }

        let Some(ts) = event.created_at_utc() else {
            return SaleVerdict::New;
        };
        let window = chrono::Duration::from_std(self.settings.similar_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let similar = self.history.values().any(|rec| {
            rec.name == event.name
                && rec.external_number == event.external_number
                && (event.amount - rec.price).abs() < eps
                && parse_ts_utc(&rec.timestamp)
                    .is_some_and(|prev_ts| (ts - prev_ts).abs() < window)
        });
        if similar {
            SaleVerdict::NearDuplicate
        } else {
            SaleVerdict::New
        }
    }

    pub fn record(&mut self, event: &SaleEvent) {
        self.history
            .insert(event.collectible_id.clone(), PriceRecord::from_event(event));
    }

    /// Drops records older than the retention window; unparseable timestamps count as expired.
    pub fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(self.settings.retention)
            .map(|d| now - d)
            .unwrap_or(now);
        let before = self.history.len();
        self.history
            .retain(|_, rec| parse_ts_utc(&rec.timestamp).is_some_and(|ts| ts >= cutoff));
        before - self.history.len()
    }

    pub fn get(&self, collectible_id: &str) -> Option<&PriceRecord> {
        self.history.get(collectible_id)
    }

    pub fn records(&self) -> &BTreeMap<String, PriceRecord> {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
