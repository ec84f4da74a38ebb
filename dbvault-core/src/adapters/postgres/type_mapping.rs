//! PostgreSQL to unified data type conversion.
//!
//! Classification works from `pg_type.typname` plus the modifiers that
//! `format_type()` renders into the declared type, e.g.
//! `character varying(40)` or `numeric(10,2)`.

use crate::models::UnifiedDataType;

/// Maps a PostgreSQL type to the unified data type system.
///
/// # Arguments
/// * `udt_name` - `pg_type.typname` (array types start with `_`)
/// * `declared_type` - Output of `format_type(atttypid, atttypmod)`
///
/// # Example
/// ```rust
/// use dbvault_core::adapters::postgres::map_postgresql_type;
/// use dbvault_core::models::UnifiedDataType;
///
/// let unified = map_postgresql_type("varchar", "character varying(40)");
/// assert_eq!(unified, UnifiedDataType::String { max_length: Some(40) });
/// ```
pub fn map_postgresql_type(udt_name: &str, declared_type: &str) -> UnifiedDataType {
    if let Some(element) = udt_name.strip_prefix('_') {
        let element_declared = declared_type.trim_end_matches("[]");
        return UnifiedDataType::Array {
            element_type: Box::new(map_postgresql_type(element, element_declared)),
        };
    }

    let modifiers = type_modifiers(declared_type);

    match udt_name.to_lowercase().as_str() {
        "varchar" | "bpchar" | "char" => UnifiedDataType::String {
            max_length: modifiers.first().copied(),
        },
        "text" | "name" | "citext" => UnifiedDataType::String { max_length: None },

        "int2" => UnifiedDataType::Integer {
            bits: 16,
            signed: true,
        },
        "int4" => UnifiedDataType::Integer {
            bits: 32,
            signed: true,
        },
        "int8" => UnifiedDataType::Integer {
            bits: 64,
            signed: true,
        },

        "float4" => UnifiedDataType::Float {
            precision: Some(24),
        },
        "float8" => UnifiedDataType::Float {
            precision: Some(53),
        },
        "numeric" => UnifiedDataType::Decimal {
            precision: modifiers.first().and_then(|p| u8::try_from(*p).ok()),
            scale: modifiers.get(1).and_then(|s| u8::try_from(*s).ok()),
        },

        "bool" => UnifiedDataType::Boolean,
        "date" => UnifiedDataType::Date,
        "time" => UnifiedDataType::Time {
            with_timezone: false,
        },
        "timetz" => UnifiedDataType::Time {
            with_timezone: true,
        },
        "timestamp" => UnifiedDataType::DateTime {
            with_timezone: false,
        },
        "timestamptz" => UnifiedDataType::DateTime {
            with_timezone: true,
        },

        "bytea" => UnifiedDataType::Binary { max_length: None },
        "json" | "jsonb" => UnifiedDataType::Json,
        "uuid" => UnifiedDataType::Uuid,

        _ => UnifiedDataType::Custom {
            type_name: declared_type.to_string(),
        },
    }
}

/// Numeric modifiers inside the first pair of parentheses.
fn type_modifiers(declared_type: &str) -> Vec<u32> {
    declared_type
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inner, _)| {
            inner
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_scalar_types() {
        assert_eq!(
            map_postgresql_type("int8", "bigint"),
            UnifiedDataType::Integer {
                bits: 64,
                signed: true
            }
        );
        assert_eq!(
            map_postgresql_type("bpchar", "character(3)"),
            UnifiedDataType::String {
                max_length: Some(3)
            }
        );
        assert_eq!(
            map_postgresql_type("timestamptz", "timestamp with time zone"),
            UnifiedDataType::DateTime {
                with_timezone: true
            }
        );
        assert_eq!(map_postgresql_type("jsonb", "jsonb"), UnifiedDataType::Json);
    }

    #[test]
    fn test_map_numeric_modifiers() {
        assert_eq!(
            map_postgresql_type("numeric", "numeric(10,2)"),
            UnifiedDataType::Decimal {
                precision: Some(10),
                scale: Some(2)
            }
        );
        assert_eq!(
            map_postgresql_type("numeric", "numeric"),
            UnifiedDataType::Decimal {
                precision: None,
                scale: None
            }
        );
    }

    #[test]
    fn test_map_array_and_custom_types() {
        assert_eq!(
            map_postgresql_type("_int4", "integer[]"),
            UnifiedDataType::Array {
                element_type: Box::new(UnifiedDataType::Integer {
                    bits: 32,
                    signed: true
                })
            }
        );
        assert_eq!(
            map_postgresql_type("mood", "mood"),
            UnifiedDataType::Custom {
                type_name: "mood".to_string()
            }
        );
    }
}
