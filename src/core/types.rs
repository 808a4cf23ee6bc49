use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::InvalidKeyReason;

/// Literal stored in a record slot when its label could not be located on the page.
pub const NOT_FOUND_MARKER: &str = "not found";

/// RUC check-digit weights applied to the first ten digits.
const RUC_WEIGHTS: [u32; 10] = [5, 4, 3, 2, 7, 6, 5, 4, 3, 2];

// ── LookupKey ────────────────────────────────────────────────────────────────

/// A validated 11-digit RUC. Constructing one is the only way into the scrape path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey(String);

impl LookupKey {
    /// Validate a raw identifier: exactly 11 ASCII digits with a valid mod-11
    /// check digit. Nothing is trimmed; surrounding whitespace is a non-digit.
    pub fn parse(raw: &str) -> Result<Self, InvalidKeyReason> {
        if raw.is_empty() {
            return Err(InvalidKeyReason::Empty);
        }
        if !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidKeyReason::NonDigit);
        }
        if raw.len() != 11 {
            return Err(InvalidKeyReason::WrongLength(raw.len()));
        }

        let digits: Vec<u32> = raw.bytes().map(|b| u32::from(b - b'0')).collect();
        if check_digit(&digits[..10]) != digits[10] {
            return Err(InvalidKeyReason::CheckDigit);
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_digit(body: &[u32]) -> u32 {
    let sum: u32 = body.iter().zip(RUC_WEIGHTS).map(|(d, w)| d * w).sum();
    match 11 - sum % 11 {
        10 => 0,
        11 => 1,
        d => d,
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LookupKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ── TaxpayerRecord ───────────────────────────────────────────────────────────

/// The fixed field set of a taxpayer record, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Identifier,
    LegalName,
    TaxpayerType,
    TradeName,
    RegistrationDate,
    ActivityStartDate,
    TaxpayerStatus,
    TaxpayerCondition,
    FiscalAddress,
    InvoicingSystem,
    ForeignTradeActivity,
    AccountingSystem,
    PrimaryActivity,
}

impl RecordField {
    pub const ALL: [RecordField; 13] = [
        RecordField::Identifier,
        RecordField::LegalName,
        RecordField::TaxpayerType,
        RecordField::TradeName,
        RecordField::RegistrationDate,
        RecordField::ActivityStartDate,
        RecordField::TaxpayerStatus,
        RecordField::TaxpayerCondition,
        RecordField::FiscalAddress,
        RecordField::InvoicingSystem,
        RecordField::ForeignTradeActivity,
        RecordField::AccountingSystem,
        RecordField::PrimaryActivity,
    ];

    /// Output key, exactly as emitted in serialized records.
    pub fn key(self) -> &'static str {
        match self {
            RecordField::Identifier => "identifier",
            RecordField::LegalName => "legal name",
            RecordField::TaxpayerType => "taxpayer type",
            RecordField::TradeName => "trade name",
            RecordField::RegistrationDate => "registration date",
            RecordField::ActivityStartDate => "activity-start date",
            RecordField::TaxpayerStatus => "taxpayer status",
            RecordField::TaxpayerCondition => "taxpayer condition",
            RecordField::FiscalAddress => "fiscal address",
            RecordField::InvoicingSystem => "invoicing system",
            RecordField::ForeignTradeActivity => "foreign-trade activity",
            RecordField::AccountingSystem => "accounting system",
            RecordField::PrimaryActivity => "primary activity",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// A closed, total taxpayer record: every field always has a value, either
/// the extracted text or [`NOT_FOUND_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxpayerRecord {
    values: [String; 13],
}

impl TaxpayerRecord {
    pub fn get(&self, field: RecordField) -> &str {
        &self.values[field.index()]
    }

    /// `true` when the slot holds the "not found" marker.
    pub fn is_missing(&self, field: RecordField) -> bool {
        self.get(field) == NOT_FOUND_MARKER
    }

    pub fn missing_fields(&self) -> Vec<RecordField> {
        RecordField::ALL
            .into_iter()
            .filter(|f| self.is_missing(*f))
            .collect()
    }

    /// Fields and values in output order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordField, &str)> + '_ {
        RecordField::ALL
            .into_iter()
            .map(move |f| (f, self.values[f.index()].as_str()))
    }
}

impl Serialize for TaxpayerRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(RecordField::ALL.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.key(), value)?;
        }
        map.end()
    }
}

/// Accumulates best-effort field values in any discovery order; `build`
/// re-sequences them into the fixed layout and fills gaps with the marker.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    values: [Option<String>; 13],
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank values count as not found.
    pub fn set(&mut self, field: RecordField, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        let trimmed = value.trim();
        self.values[field.index()] = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn build(self) -> TaxpayerRecord {
        TaxpayerRecord {
            values: self
                .values
                .map(|v| v.unwrap_or_else(|| NOT_FOUND_MARKER.to_string())),
        }
    }
}

// ── Cache entry & lookup outcome ─────────────────────────────────────────────

/// A record plus the moment it was scraped. Records are shared, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Arc<TaxpayerRecord>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(record: TaxpayerRecord) -> Self {
        Self {
            record: Arc::new(record),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    Cache,
    Portal,
}

impl LookupSource {
    /// Value of the `x-cache` response header.
    pub fn cache_header(&self) -> &'static str {
        match self {
            LookupSource::Cache => "hit",
            LookupSource::Portal => "miss",
        }
    }
}

/// Result of a successful lookup, with the timing observable by callers.
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub key: LookupKey,
    pub entry: CacheEntry,
    pub source: LookupSource,
    pub elapsed: Duration,
}

impl LookupOutcome {
    pub fn record(&self) -> &TaxpayerRecord {
        &self.entry.record
    }
}

// ── HTTP payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupQuery {
    #[serde(default)]
    pub ruc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}
