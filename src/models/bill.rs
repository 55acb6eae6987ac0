use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// JSON field the model is asked to fill.
pub const BILL_NUMBER_FIELD: &str = "consumer_Bill_Number";

/// Value the model returns when no bill number is visible.
pub const NOT_FOUND_SENTINEL: &str = "NOT_FOUND";

/// Exact-format predicate for consumer bill numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierFormat {
    pub digits: usize,
}

impl Default for IdentifierFormat {
    fn default() -> Self {
        Self { digits: 12 }
    }
}

impl IdentifierFormat {
    pub fn matches(&self, value: &str) -> bool {
        value.len() == self.digits && value.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Structured reply demanded from the recognition service.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[garde(context(IdentifierFormat))]
pub struct BillNumberReply {
    #[serde(rename = "consumer_Bill_Number")]
    #[garde(custom(matches_format))]
    pub consumer_bill_number: String,
}

impl BillNumberReply {
    /// The model signalled that the label is absent.
    pub fn is_not_found(&self) -> bool {
        let value = self.consumer_bill_number.trim();
        value.is_empty() || value.eq_ignore_ascii_case(NOT_FOUND_SENTINEL)
    }
}

#[allow(clippy::ptr_arg)]
fn matches_format(value: &String, format: &IdentifierFormat) -> garde::Result {
    if format.matches(value.trim()) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "expected exactly {} digits, got {:?}",
            format.digits, value
        )))
    }
}

/// A consumer bill number that passed the format predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedIdentifier(String);

impl ExtractedIdentifier {
    pub fn parse(raw: &str, format: &IdentifierFormat) -> Option<Self> {
        let value = raw.trim();
        format.matches(value).then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtractedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
