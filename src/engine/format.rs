//! Channel message rendering. Pure: same sale in, same text out.

use crate::engine::types::{AttributeKind, SaleEvent};
use rust_decimal::Decimal;
use std::fmt::Write;

const NFT_LINK_BASE: &str = "https://t.me/nft/";

#[derive(Debug, Clone, Copy)]
pub struct ValueTiers {
    pub high: Decimal,
    pub ultra: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleTier {
    Regular,
    High,
    Ultra,
}

impl SaleTier {
    pub fn for_amount(amount: Decimal, tiers: &ValueTiers) -> Self {
        if amount >= tiers.ultra {
            SaleTier::Ultra
        } else if amount >= tiers.high {
            SaleTier::High
        } else {
            SaleTier::Regular
        }
    }

    fn headline(self) -> &'static str {
        match self {
            SaleTier::Regular => "GIFT SOLD!",
            SaleTier::High => "HIGH-VALUE GIFT SOLD!",
            SaleTier::Ultra => "ULTRA GIFT SOLD!",
        }
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// `YYYY-MM-DD HH:MM UTC`, or the raw string when it does not parse.
pub fn format_timestamp(raw: &str) -> String {
    match crate::engine::types::parse_ts_utc(raw) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => raw.to_string(),
    }
}

pub fn format_sale(event: &SaleEvent, tiers: &ValueTiers) -> String {
    let name = escape_html(&event.name);
    let tier = SaleTier::for_amount(event.amount, tiers);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "<a href=\"{NFT_LINK_BASE}{}\">{name} #{}</a>",
        escape_html(&event.link_slug()),
        event.external_number
    );
    out.push('\n');
    let _ = writeln!(out, "┌─🎉 {}", tier.headline());
    out.push_str("│\n");
    let _ = writeln!(out, "├ Gift Name: {name}");
    let _ = writeln!(out, "├ Floor Price: {} TON", event.floor_price.normalize());
    let _ = writeln!(out, "├ Sold For: {} TON", event.amount.normalize());

    let traits: Vec<String> = [AttributeKind::Model, AttributeKind::Symbol, AttributeKind::Backdrop]
        .iter()
        .filter_map(|kind| event.attribute(kind))
        .map(|a| {
            format!(
                "├ {}: {} ({}‰)",
                a.kind.label(),
                escape_html(&a.value),
                a.rarity_per_mille
            )
        })
        .collect();
    if !traits.is_empty() {
        out.push_str("│\n");
        for line in traits {
            out.push_str(&line);
            out.push('\n');
        }
    }

    out.push_str("│\n");
    let _ = write!(out, "└─ Date: {}", escape_html(&format_timestamp(&event.created_at)));
    out
}
