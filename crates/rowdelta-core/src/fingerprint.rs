//! Row fingerprints and column-level diffs.
//!
//! A fingerprint is a SHA-256 digest over the canonical form of a row's
//! business columns. The merge engine stores it next to each row so that a
//! re-ingested, unchanged row can be classified without comparing columns.
//!
//! ## Encoding
//!
//! ```text
//! field(tag) field(col_1) field(val_1) ... field(col_n) field(val_n)
//! field(x) = len(x) as u64 little-endian || x
//! ```
//!
//! `tag` is [`FINGERPRINT_VERSION`]; columns are sorted by name and
//! deduplicated, values use
//! [`Value::canonical`](crate::Value::canonical). Column names are part of
//! the digest, so fingerprints computed over a different column set never
//! collide with the current one.

use sha2::{Digest, Sha256};

use crate::value::{column_value, Row};

/// Algorithm tag mixed into every fingerprint.
pub const FINGERPRINT_VERSION: &str = "rowdelta.fp.v1";

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Computes the fingerprint of `row` over `columns`.
///
/// The result is independent of the order of `columns` and of the row's
/// other columns. Absent columns hash like `Null`, which hashes like `""`.
#[must_use]
pub fn fingerprint<S: AsRef<str>>(row: &Row, columns: &[S]) -> String {
    let mut names: Vec<&str> = columns.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();
    names.dedup();

    let mut hasher = Sha256::new();
    write_field(&mut hasher, FINGERPRINT_VERSION.as_bytes());
    for name in names {
        write_field(&mut hasher, name.as_bytes());
        write_field(&mut hasher, column_value(row, name).canonical().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Returns the columns of `columns` whose values differ between the rows.
///
/// Columns are returned in the order given. A missing `existing` row means
/// every column counts as changed (insert classification).
#[must_use]
pub fn diff_columns<S: AsRef<str>>(
    existing: Option<&Row>,
    incoming: &Row,
    columns: &[S],
) -> Vec<String> {
    let Some(existing) = existing else {
        return columns.iter().map(|c| c.as_ref().to_string()).collect();
    };
    columns
        .iter()
        .map(AsRef::as_ref)
        .filter(|c| !column_value(existing, c).same_as(column_value(incoming, c)))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{row_of, Value};

    fn sample() -> Row {
        row_of([
            ("order_id", Value::Int(1)),
            ("region", Value::Text("EU".into())),
            ("revenue", Value::Float(100.0)),
            ("note", Value::Null),
        ])
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let row = sample();
        let cols = ["region", "revenue", "note"];
        assert_eq!(fingerprint(&row, &cols), fingerprint(&row, &cols));
        assert_eq!(fingerprint(&row, &cols).len(), FINGERPRINT_HEX_LEN);
        assert!(fingerprint(&row, &cols)
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_ignores_column_order() {
        let row = sample();
        assert_eq!(
            fingerprint(&row, &["region", "revenue", "note"]),
            fingerprint(&row, &["note", "revenue", "region", "region"])
        );
    }

    #[test]
    fn test_fingerprint_normalizes_null_and_numbers() {
        let a = row_of([("x", Value::Null), ("y", Value::Int(100))]);
        let b = row_of([("x", Value::Text(String::new())), ("y", Value::Float(100.0))]);
        let c = row_of([("y", Value::Int(100))]);
        assert_eq!(fingerprint(&a, &["x", "y"]), fingerprint(&b, &["x", "y"]));
        assert_eq!(fingerprint(&a, &["x", "y"]), fingerprint(&c, &["x", "y"]));
    }

    #[test]
    fn test_fingerprint_ignores_other_columns() {
        let mut row = sample();
        let before = fingerprint(&row, &["region", "revenue"]);
        row.insert("source_row_num".into(), Value::Int(99));
        assert_eq!(fingerprint(&row, &["region", "revenue"]), before);
    }

    #[test]
    fn test_fingerprint_depends_on_column_set() {
        let row = row_of([("a", Value::Text("1".into())), ("b", Value::Null)]);
        assert_ne!(fingerprint(&row, &["a"]), fingerprint(&row, &["a", "b"]));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let a = row_of([("a", Value::Text("bc".into())), ("ab", Value::Text("c".into()))]);
        let b = row_of([("a", Value::Text("b".into())), ("ab", Value::Text("cc".into()))]);
        assert_ne!(fingerprint(&a, &["a", "ab"]), fingerprint(&b, &["a", "ab"]));
    }

    #[test]
    fn test_diff_columns_reports_changes_in_order() {
        let existing = sample();
        let mut incoming = sample();
        incoming.insert("revenue".into(), Value::Float(150.0));
        incoming.insert("region".into(), Value::Text("US".into()));
        let changed = diff_columns(Some(&existing), &incoming, &["revenue", "note", "region"]);
        assert_eq!(changed, vec!["revenue".to_string(), "region".to_string()]);
    }

    #[test]
    fn test_diff_columns_without_existing_is_all_columns() {
        let incoming = sample();
        let changed = diff_columns(None, &incoming, &["region", "revenue"]);
        assert_eq!(changed, vec!["region".to_string(), "revenue".to_string()]);
    }

    #[test]
    fn test_diff_columns_identical_rows() {
        let row = sample();
        assert!(diff_columns(Some(&row), &row, &["region", "revenue", "note"]).is_empty());
    }
}
