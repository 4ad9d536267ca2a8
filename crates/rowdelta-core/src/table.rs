//! Target table declarations.
//!
//! A [`TableSpec`] tells the merge engine which column keys a row, which
//! columns carry business meaning (and therefore drive change detection),
//! which of those are protected against silent overwrites, and which columns
//! are carried along as metadata only.

use std::collections::HashSet;

/// Declaration of a merge target table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableSpec {
    /// Table name in the relational store.
    pub name: String,
    /// Primary-key column (the upsert conflict key).
    pub primary_key: String,
    /// Business columns, in caller-declared order.
    pub business_columns: Vec<String>,
    /// Business columns whose change on an existing row is a conflict.
    ///
    /// Evaluated in declared order; every differing protected column is
    /// reported.
    #[serde(default)]
    pub protected_columns: Vec<String>,
    /// Columns written with the row but ignored by change detection
    /// (e.g. `source_row_num`).
    #[serde(default)]
    pub metadata_columns: Vec<String>,
    /// Optional ISO-8601 date column used to derive a run's date bounds.
    #[serde(default)]
    pub date_column: Option<String>,
}

/// Errors from [`TableSpec::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableSpecError {
    /// The table name is blank.
    #[error("table name is empty")]
    EmptyName,

    /// The primary-key column is blank.
    #[error("table '{0}': primary key column is empty")]
    EmptyPrimaryKey(String),

    /// No business column remains after excluding key and metadata columns.
    #[error("table '{0}': no business columns to compare")]
    NoBusinessColumns(String),

    /// A column is declared more than once across business/metadata lists.
    #[error("table '{table}': column '{column}' declared more than once")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Offending column.
        column: String,
    },

    /// A protected column is not a business column.
    #[error("table '{table}': protected column '{column}' is not a business column")]
    ProtectedNotBusiness {
        /// Table name.
        table: String,
        /// Offending column.
        column: String,
    },
}

impl TableSpec {
    /// Creates a table declaration with no columns besides the key.
    #[must_use]
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            business_columns: Vec::new(),
            protected_columns: Vec::new(),
            metadata_columns: Vec::new(),
            date_column: None,
        }
    }

    /// Sets the business columns.
    #[must_use]
    pub fn with_business_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.business_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the protected columns.
    #[must_use]
    pub fn with_protected_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the metadata-only columns.
    #[must_use]
    pub fn with_metadata_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the date column used for run date bounds.
    #[must_use]
    pub fn with_date_column(mut self, column: impl Into<String>) -> Self {
        self.date_column = Some(column.into());
        self
    }

    /// Checks the declaration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`TableSpecError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), TableSpecError> {
        if self.name.trim().is_empty() {
            return Err(TableSpecError::EmptyName);
        }
        if self.primary_key.trim().is_empty() {
            return Err(TableSpecError::EmptyPrimaryKey(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for column in self.business_columns.iter().chain(&self.metadata_columns) {
            if !seen.insert(column.as_str()) {
                return Err(TableSpecError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }

        if let Some(column) = self
            .protected_columns
            .iter()
            .find(|c| !self.business_columns.contains(c) || **c == self.primary_key)
        {
            return Err(TableSpecError::ProtectedNotBusiness {
                table: self.name.clone(),
                column: column.clone(),
            });
        }

        if self.compare_columns(None).is_empty() {
            return Err(TableSpecError::NoBusinessColumns(self.name.clone()));
        }
        Ok(())
    }

    /// Business columns that participate in change detection.
    ///
    /// Excludes the primary key, metadata columns and the given bookkeeping
    /// columns (fingerprint, last-change-event reference).
    #[must_use]
    pub fn compare_columns(&self, bookkeeping: Option<&[&str]>) -> Vec<&str> {
        let bookkeeping = bookkeeping.unwrap_or(&[]);
        self.business_columns
            .iter()
            .map(String::as_str)
            .filter(|c| *c != self.primary_key)
            .filter(|c| !self.metadata_columns.iter().any(|m| m == c))
            .filter(|c| !bookkeeping.contains(c))
            .collect()
    }

    /// Returns `true` if `column` is declared protected.
    #[must_use]
    pub fn is_protected(&self, column: &str) -> bool {
        self.protected_columns.iter().any(|c| c == column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> TableSpec {
        TableSpec::new("stg_sales_orders", "order_id")
            .with_business_columns(["order_date", "region", "revenue"])
            .with_protected_columns(["order_date"])
            .with_metadata_columns(["source_row_num"])
    }

    #[test]
    fn test_valid_spec() {
        assert!(sales().validate().is_ok());
        assert!(sales().is_protected("order_date"));
        assert!(!sales().is_protected("revenue"));
    }

    #[test]
    fn test_compare_columns_excludes_bookkeeping() {
        let spec = sales().with_business_columns(["order_id", "order_date", "row_hash", "revenue"]);
        assert_eq!(
            spec.compare_columns(Some(&["row_hash"])),
            vec!["order_date", "revenue"]
        );
    }

    #[test]
    fn test_empty_name_and_key() {
        assert_eq!(
            TableSpec::new(" ", "id").validate(),
            Err(TableSpecError::EmptyName)
        );
        assert_eq!(
            TableSpec::new("t", "").validate(),
            Err(TableSpecError::EmptyPrimaryKey("t".into()))
        );
    }

    #[test]
    fn test_protected_must_be_business() {
        let spec = sales().with_protected_columns(["source_row_num"]);
        assert!(matches!(
            spec.validate(),
            Err(TableSpecError::ProtectedNotBusiness { column, .. }) if column == "source_row_num"
        ));
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let spec = sales().with_metadata_columns(["region"]);
        assert!(matches!(
            spec.validate(),
            Err(TableSpecError::DuplicateColumn { column, .. }) if column == "region"
        ));
    }

    #[test]
    fn test_no_business_columns() {
        let spec = TableSpec::new("t", "id").with_business_columns(["id"]);
        assert_eq!(
            spec.validate(),
            Err(TableSpecError::NoBusinessColumns("t".into()))
        );
    }
}
