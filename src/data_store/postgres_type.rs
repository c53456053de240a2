use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PostgresType {
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Real,
    DoublePrecision,
    Varchar,
    Char,
    Text,
    Uuid,
    Json,
    Jsonb,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Interval,
    Boolean,
    Name,
    ByteA,
}

impl PostgresType {
    /// Storage class the type lands in when materialized into SQLite.
    pub fn sqlite_affinity(&self) -> &'static str {
        match self {
            PostgresType::SmallInt | PostgresType::Integer | PostgresType::BigInt => "INTEGER",
            PostgresType::Boolean => "INTEGER",
            PostgresType::Real | PostgresType::DoublePrecision => "REAL",
            PostgresType::Numeric => "NUMERIC",
            PostgresType::ByteA => "BLOB",
            _ => "TEXT",
        }
    }
}

impl FromStr for PostgresType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int2" | "smallint" => Ok(PostgresType::SmallInt),
            "int4" | "int" | "integer" => Ok(PostgresType::Integer),
            "int8" | "bigint" => Ok(PostgresType::BigInt),
            "numeric" | "decimal" => Ok(PostgresType::Numeric),
            "float4" | "real" => Ok(PostgresType::Real),
            "float8" | "double" | "double precision" => Ok(PostgresType::DoublePrecision),
            "varchar" | "character varying" => Ok(PostgresType::Varchar),
            "bpchar" | "char" => Ok(PostgresType::Char),
            "text" => Ok(PostgresType::Text),
            "uuid" => Ok(PostgresType::Uuid),
            "json" => Ok(PostgresType::Json),
            "jsonb" => Ok(PostgresType::Jsonb),
            "timestamp" => Ok(PostgresType::Timestamp),
            "timestamptz" => Ok(PostgresType::TimestampTz),
            "date" => Ok(PostgresType::Date),
            "time" => Ok(PostgresType::Time),
            "interval" => Ok(PostgresType::Interval),
            "bool" | "boolean" => Ok(PostgresType::Boolean),
            "name" => Ok(PostgresType::Name),
            "bytea" => Ok(PostgresType::ByteA),
            _ => Err(format!("Unknown PostgreSQL type: {}", s)),
        }
    }
}

/// Declared SQLite column type for a source column type name.
///
/// Names that are not PostgreSQL types follow SQLite's own affinity rules, and columns
/// without a declared type stay untyped.
pub fn column_affinity(type_name: &str) -> &'static str {
    let lower = type_name.trim().to_lowercase();
    if lower.is_empty() {
        return "";
    }
    if let Ok(pg_type) = PostgresType::from_str(&lower) {
        return pg_type.sqlite_affinity();
    }
    if lower.contains("int") {
        "INTEGER"
    } else if lower.contains("char") || lower.contains("clob") || lower.contains("text") {
        "TEXT"
    } else if lower.contains("blob") {
        "BLOB"
    } else if lower.contains("real") || lower.contains("floa") || lower.contains("doub") {
        "REAL"
    } else {
        "NUMERIC"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_from_str() {
        assert_eq!(PostgresType::from_str("int4").unwrap(), PostgresType::Integer);
        assert_eq!(PostgresType::from_str("varchar").unwrap(), PostgresType::Varchar);
        assert_eq!(PostgresType::from_str("timestamp").unwrap(), PostgresType::Timestamp);
        assert_eq!(PostgresType::from_str("bool").unwrap(), PostgresType::Boolean);
    }

    #[test]
    fn test_from_str_unknown_type() {
        assert!(PostgresType::from_str("unknown_type").is_err());
    }

    #[rstest]
    #[case::postgres_int("int8", "INTEGER")]
    #[case::postgres_float("float8", "REAL")]
    #[case::manifest_double("double", "REAL")]
    #[case::postgres_date("date", "TEXT")]
    #[case::sqlite_declared("VARCHAR(50)", "TEXT")]
    #[case::sqlite_unsigned("UNSIGNED BIG INT", "INTEGER")]
    #[case::untyped("", "")]
    fn test_column_affinity(#[case] type_name: &str, #[case] expected: &str) {
        assert_eq!(column_affinity(type_name), expected);
    }
}
