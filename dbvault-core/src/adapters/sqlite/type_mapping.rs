//! Declared SQLite column types to [`UnifiedDataType`].
//!
//! SQLite stores whatever it is given; the declared type only selects a
//! column affinity. The unified type is derived from that affinity first
//! and refined by well-known type names second. Restores always reuse the
//! declared type text, so a coarse mapping never loses information.

use crate::models::UnifiedDataType;

/// Column affinity as assigned by SQLite's type-name rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Applies the affinity rules in SQLite's order of precedence.
    pub fn of(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if ["CHAR", "CLOB", "TEXT"].iter().any(|k| upper.contains(k)) {
            Self::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Self::Blob
        } else if ["REAL", "FLOA", "DOUB"].iter().any(|k| upper.contains(k)) {
            Self::Real
        } else {
            Self::Numeric
        }
    }
}

/// Maps a declared column type.
///
/// ```rust
/// use dbvault_core::adapters::sqlite::map_sqlite_type;
/// use dbvault_core::models::UnifiedDataType;
///
/// assert_eq!(
///     map_sqlite_type("varchar(80)"),
///     UnifiedDataType::String { max_length: Some(80) }
/// );
/// ```
pub fn map_sqlite_type(declared: &str) -> UnifiedDataType {
    let upper = declared.trim().to_ascii_uppercase();
    let (name, params) = split_params(&upper);

    match Affinity::of(&upper) {
        Affinity::Integer => UnifiedDataType::Integer {
            bits: integer_width(name),
            signed: true,
        },
        Affinity::Text => UnifiedDataType::String {
            max_length: params.first().copied(),
        },
        Affinity::Blob => UnifiedDataType::Binary {
            max_length: params.first().copied(),
        },
        Affinity::Real => UnifiedDataType::Float {
            // FLOAT alone is single precision in most dialects
            precision: Some(if name == "FLOAT" { 24 } else { 53 }),
        },
        Affinity::Numeric => match name {
            "BOOLEAN" | "BOOL" => UnifiedDataType::Boolean,
            "DATE" => UnifiedDataType::Date,
            "TIME" => UnifiedDataType::Time {
                with_timezone: false,
            },
            "DATETIME" | "TIMESTAMP" => UnifiedDataType::DateTime {
                with_timezone: false,
            },
            "JSON" | "JSONB" => UnifiedDataType::Json,
            "UUID" | "GUID" => UnifiedDataType::Uuid,
            "NUMERIC" | "DECIMAL" | "NUMBER" => UnifiedDataType::Decimal {
                precision: params.first().and_then(|p| u8::try_from(*p).ok()),
                scale: params.get(1).and_then(|s| u8::try_from(*s).ok()),
            },
            _ => UnifiedDataType::Custom {
                type_name: declared.to_string(),
            },
        },
    }
}

fn integer_width(name: &str) -> u8 {
    match name {
        "TINYINT" => 8,
        "SMALLINT" | "INT2" => 16,
        "MEDIUMINT" | "INT3" => 24,
        "INT" | "INTEGER" | "INT4" => 32,
        // SQLite stores every integer in up to 8 bytes
        _ => 64,
    }
}

/// `DECIMAL(10, 2)` becomes `("DECIMAL", [10, 2])`; unparsable parameters
/// are dropped.
fn split_params(upper: &str) -> (&str, Vec<u32>) {
    let Some((name, rest)) = upper.split_once('(') else {
        return (upper, Vec::new());
    };
    let params = rest
        .trim_end_matches(')')
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect();
    (name.trim(), params)
}
