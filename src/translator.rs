//! Driver error translation.
//!
//! Maps vendor-specific error codes onto the semantic [`ErrorKind`] taxonomy
//! through a per-dialect lookup table. Tables are configuration data, not
//! code: they deserialize from JSON, carry a version, and are loaded once at
//! startup. Translation itself never fails: an unmapped or missing code
//! simply classifies as [`ErrorKind::Unknown`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DriverError, ErrorKind, TxError};

/// A versioned vendor-code table for one database dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialectConfig {
    /// Dialect name, e.g. "h2" or "postgres".
    pub name: String,
    /// Table revision, bumped when code mappings change.
    #[serde(default)]
    pub version: u32,
    /// Vendor error code to semantic kind.
    pub codes: HashMap<String, ErrorKind>,
}

impl DialectConfig {
    /// Load a dialect table from a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, String> {
        serde_json::from_str(s).map_err(|e| format!("invalid dialect table: {e}"))
    }

    fn from_entries(name: &str, version: u32, entries: &[(&str, ErrorKind)]) -> Self {
        Self {
            name: name.to_string(),
            version,
            codes: entries
                .iter()
                .map(|(code, kind)| (code.to_string(), *kind))
                .collect(),
        }
    }

    /// Built-in table for the H2 dialect.
    pub fn h2() -> Self {
        Self::from_entries(
            "h2",
            1,
            &[
                ("23001", ErrorKind::DuplicateKey),
                ("23505", ErrorKind::DuplicateKey),
                ("22001", ErrorKind::DataIntegrityViolation),
                ("23502", ErrorKind::DataIntegrityViolation),
                ("23503", ErrorKind::DataIntegrityViolation),
                ("23506", ErrorKind::DataIntegrityViolation),
                ("23507", ErrorKind::DataIntegrityViolation),
                ("23513", ErrorKind::DataIntegrityViolation),
                ("42000", ErrorKind::SyntaxError),
                ("42001", ErrorKind::SyntaxError),
                ("42101", ErrorKind::SyntaxError),
                ("42102", ErrorKind::SyntaxError),
                ("42111", ErrorKind::SyntaxError),
                ("42112", ErrorKind::SyntaxError),
                ("42121", ErrorKind::SyntaxError),
                ("42122", ErrorKind::SyntaxError),
                ("42132", ErrorKind::SyntaxError),
                ("40001", ErrorKind::TransientError),
                ("50200", ErrorKind::TransientError),
            ],
        )
    }

    /// Built-in table for the PostgreSQL dialect (SQLSTATE codes).
    pub fn postgres() -> Self {
        Self::from_entries(
            "postgres",
            1,
            &[
                ("23505", ErrorKind::DuplicateKey),
                ("23502", ErrorKind::DataIntegrityViolation),
                ("23503", ErrorKind::DataIntegrityViolation),
                ("23514", ErrorKind::DataIntegrityViolation),
                ("42601", ErrorKind::SyntaxError),
                ("42602", ErrorKind::SyntaxError),
                ("42622", ErrorKind::SyntaxError),
                ("42804", ErrorKind::SyntaxError),
                ("42P01", ErrorKind::SyntaxError),
                ("40001", ErrorKind::TransientError),
                ("40P01", ErrorKind::TransientError),
                ("55P03", ErrorKind::TransientError),
            ],
        )
    }

    /// Built-in table for the MySQL dialect (vendor error numbers).
    pub fn mysql() -> Self {
        Self::from_entries(
            "mysql",
            1,
            &[
                ("1062", ErrorKind::DuplicateKey),
                ("1586", ErrorKind::DuplicateKey),
                ("1048", ErrorKind::DataIntegrityViolation),
                ("1216", ErrorKind::DataIntegrityViolation),
                ("1217", ErrorKind::DataIntegrityViolation),
                ("1451", ErrorKind::DataIntegrityViolation),
                ("1452", ErrorKind::DataIntegrityViolation),
                ("1557", ErrorKind::DataIntegrityViolation),
                ("1054", ErrorKind::SyntaxError),
                ("1064", ErrorKind::SyntaxError),
                ("1146", ErrorKind::SyntaxError),
                ("1205", ErrorKind::TransientError),
                ("1213", ErrorKind::TransientError),
            ],
        )
    }
}

/// Classifies raw driver errors for one dialect.
pub struct ErrorTranslator {
    dialect: DialectConfig,
}

impl ErrorTranslator {
    pub fn new(dialect: DialectConfig) -> Self {
        Self { dialect }
    }

    /// Name of the dialect this translator classifies for.
    pub fn dialect_name(&self) -> &str {
        &self.dialect.name
    }

    /// Classify a raw driver error.
    ///
    /// `operation` is a short label for the failed data-access operation
    /// ("save member", "update balance"); `statement` is the statement text
    /// that was running. Both go into the composed message so the caller can
    /// see at a glance what failed; the raw error always rides along as the
    /// cause.
    pub fn translate(&self, operation: &str, statement: &str, raw: DriverError) -> TxError {
        let kind = raw
            .code
            .as_deref()
            .and_then(|code| self.dialect.codes.get(code))
            .copied()
            .unwrap_or(ErrorKind::Unknown);

        if kind == ErrorKind::Unknown {
            debug!(
                dialect = %self.dialect.name,
                code = ?raw.code,
                "unmapped driver error code"
            );
        }

        let message = format!(
            "{operation} failed; statement [{statement}]; {}",
            raw.message
        );
        TxError::classified(kind, message, raw)
    }
}
