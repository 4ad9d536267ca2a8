//! Tagged column values and row images.
//!
//! Row images travel through the merge engine, the change ledger (as before/
//! after snapshots) and the rollback path, so they need a representation that
//! survives a JSON round-trip without losing the scalar kind. [`Value`] is a
//! small tagged enum over the scalar kinds the ingested datasets carry, and a
//! [`Row`] is an ordered map from column name to [`Value`].
//!
//! ## Canonical form
//!
//! Every value has a canonical text form ([`Value::canonical`]) used for
//! fingerprinting, column comparison and primary-key rendering:
//!
//! | Value            | Canonical     |
//! |------------------|---------------|
//! | `Null`           | `""`          |
//! | `Bool(true)`     | `"true"`      |
//! | `Int(150)`       | `"150"`       |
//! | `Float(150.0)`   | `"150"`       |
//! | `Float(0.25)`    | `"0.25"`      |
//! | `Text("abc")`    | `"abc"`       |

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A row image: column name to value, ordered by column name.
pub type Row = BTreeMap<String, Value>;

/// Largest float magnitude that still converts exactly to an `i64`.
const EXACT_INT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Primary-key spellings that mean "no key" in spreadsheet exports.
const BLANK_KEY_SPELLINGS: [&str; 3] = ["nan", "none", "null"];

/// A single column value.
///
/// Serializes as a bare JSON scalar. JSON has no NaN or infinity, so a
/// non-finite `Float` is written as `null` and reads back as `Null`; a
/// before-image holding one loses it once it goes through a JSON ledger.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent or SQL `NULL`.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number. Non-finite values persist as `Null`.
    Float(f64),
    /// Free text (dates travel as ISO-8601 text).
    Text(String),
}

impl Value {
    /// Returns the canonical text form of this value.
    #[must_use]
    pub fn canonical(&self) -> Cow<'_, str> {
        match self {
            Self::Null => Cow::Borrowed(""),
            Self::Bool(true) => Cow::Borrowed("true"),
            Self::Bool(false) => Cow::Borrowed("false"),
            Self::Int(i) => Cow::Owned(i.to_string()),
            Self::Float(f) => Cow::Owned(canonical_float(*f)),
            Self::Text(s) => Cow::Borrowed(s.as_str()),
        }
    }

    /// Compares two values by canonical form.
    ///
    /// `Null` equals `Text("")` and `Int(150)` equals `Float(150.0)`, matching
    /// the equality the fingerprint uses.
    #[must_use]
    pub fn same_as(&self, other: &Value) -> bool {
        self.canonical() == other.canonical()
    }

    /// Returns `true` for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the inner string for `Text` values.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the value as an integer when it is integral.
    ///
    /// Text is parsed, so a `"42"` read from a spreadsheet still yields `42`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < EXACT_INT_LIMIT => {
                Some(*f as i64)
            }
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Renders this value as a primary-key string.
    ///
    /// Returns `None` when the value cannot identify a row: null, empty or
    /// whitespace-only text, a NaN float, or one of the textual "no value"
    /// spellings (`nan`, `none`, `null`, any case).
    #[must_use]
    pub fn key_text(&self) -> Option<String> {
        if let Self::Float(f) = self {
            if f.is_nan() {
                return None;
            }
        }
        let canonical = self.canonical();
        let key = canonical.trim();
        if key.is_empty()
            || BLANK_KEY_SPELLINGS
                .iter()
                .any(|blank| key.eq_ignore_ascii_case(blank))
        {
            return None;
        }
        Some(key.to_string())
    }
}

fn canonical_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f.fract() == 0.0 && f.abs() < EXACT_INT_LIMIT {
        #[allow(clippy::cast_possible_truncation)]
        let integral = f as i64;
        return integral.to_string();
    }
    // Display for f64 is the shortest representation that round-trips.
    format!("{f}")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            other => f.write_str(&other.canonical()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Builds a [`Row`] from `(column, value)` pairs.
///
/// ```
/// use rowdelta_core::{row_of, Value};
///
/// let row = row_of([("order_id", Value::from(1)), ("revenue", Value::from(100.0))]);
/// assert_eq!(row.len(), 2);
/// ```
pub fn row_of<K, I>(pairs: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Looks up a column, treating an absent column as `Null`.
#[must_use]
pub fn column_value<'r>(row: &'r Row, column: &str) -> &'r Value {
    const NULL: &Value = &Value::Null;
    row.get(column).unwrap_or(NULL)
}
