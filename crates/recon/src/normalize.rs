//! Normalizer: maps one source's raw fields onto the canonical record.
//!
//! Never fails a record: unparseable numbers become zero, absent fields are
//! listed in `missing_fields`, and an underivable key leaves the record in the
//! unmapped group so the gap shows up downstream instead of vanishing.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::config::{parse_timestamp, SourceConfig};
use crate::model::{CanonicalRecord, GroupKey, RawRecord};

pub struct Normalizer<'a> {
    source_name: &'a str,
    config: &'a SourceConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(source_name: &'a str, config: &'a SourceConfig) -> Self {
        Self {
            source_name,
            config,
        }
    }

    pub fn normalize(&self, raw: RawRecord) -> CanonicalRecord {
        let fields = &self.config.fields;
        let mut missing = Vec::new();

        let text = |name: &Option<String>, missing: &mut Vec<String>| -> Option<String> {
            let name = name.as_ref()?;
            let value = raw.text(name);
            if value.is_none() {
                missing.push(name.clone());
            }
            value
        };

        // Group key: every key field must be present, otherwise unmapped.
        let mut parts = Vec::with_capacity(fields.key.len());
        for name in &fields.key {
            match raw.text(name) {
                Some(v) => parts.push(v),
                None => missing.push(name.clone()),
            }
        }
        let key = if parts.len() == fields.key.len() {
            parts.join(&fields.key_separator)
        } else {
            String::new()
        };
        let mut group_key = GroupKey::new(key);

        if fields.date.is_some() {
            match text(&fields.date, &mut missing).and_then(|v| parse_timestamp(&v)) {
                Some(ts) => group_key = group_key.with_date(ts.date()),
                None => {
                    if let Some(ref name) = fields.date {
                        if !missing.contains(name) {
                            missing.push(name.clone());
                        }
                    }
                }
            }
        }

        let channel = text(&fields.channel, &mut missing).or_else(|| self.config.channel.clone());
        if let Some(channel) = channel {
            group_key = group_key.with_channel(channel);
        }

        let quantity = text(&fields.quantity, &mut missing).and_then(|v| {
            let q = parse_quantity(&v);
            if q.is_none() {
                missing.push(fields.quantity.clone().unwrap_or_default());
            }
            q
        });
        let unit_price = text(&fields.unit_price, &mut missing).map(|v| parse_decimal_or_zero(&v));

        let mut amount = match text(&fields.amount, &mut missing) {
            Some(v) => parse_decimal_or_zero(&v),
            None => match (quantity, unit_price) {
                (Some(q), Some(p)) => Decimal::from(q).checked_mul(p).unwrap_or(Decimal::ZERO),
                _ => Decimal::ZERO,
            },
        };

        if let Some(ref xf) = self.config.transform {
            let applies = match (&xf.when_field, &xf.when_values) {
                (Some(field), Some(values)) => raw
                    .text(field)
                    .is_some_and(|v| values.iter().any(|w| w.eq_ignore_ascii_case(&v))),
                _ => true,
            };
            if applies {
                amount = amount.checked_mul(xf.multiply).unwrap_or(amount);
            }
        }

        let timestamp_field = fields.timestamp.as_ref().unwrap_or(&self.config.range_field);
        let timestamp = raw.text(timestamp_field).and_then(|v| parse_timestamp(&v));

        let reference_id = text(&fields.reference, &mut missing).unwrap_or_default();
        let line = text(&fields.line, &mut missing);
        let upstream_ref = text(&fields.upstream_ref, &mut missing);
        let currency = text(&fields.currency, &mut missing).map(|c| c.to_ascii_uppercase());
        let supplier = text(&fields.supplier, &mut missing);

        let approved = fields.approval.as_ref().and_then(|rule| {
            raw.text(&rule.field).map(|v| {
                rule.approved_values
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(&v))
            })
        });

        let excluded = self.config.exclude.as_ref().is_some_and(|rule| {
            raw.text(&rule.field)
                .is_some_and(|v| rule.values.iter().any(|x| x.eq_ignore_ascii_case(&v)))
        });

        missing.dedup();

        CanonicalRecord {
            group_key,
            stage: self.config.stage,
            source: self.source_name.to_string(),
            amount,
            quantity,
            unit_price,
            timestamp,
            reference_id,
            line,
            upstream_ref,
            currency,
            supplier,
            approved,
            excluded,
            missing_fields: missing,
            raw,
        }
    }
}

/// Parse a decimal amount, tolerating thousands separators and surrounding
/// whitespace. Anything unparseable is zero.
pub fn parse_decimal_or_zero(value: &str) -> Decimal {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' '))
        .collect();
    if cleaned.is_empty() {
        return Decimal::ZERO;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .unwrap_or(Decimal::ZERO)
}

/// Whole-unit quantity. `"60"` and `"60.0"` parse; `"60.5"` does not.
fn parse_quantity(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(q) = trimmed.parse::<i64>() {
        return Some(q);
    }
    let d = Decimal::from_str(trimmed).ok()?;
    if d.fract().is_zero() {
        i64::try_from(d.trunc()).ok()
    } else {
        None
    }
}
