use crate::data_store::{ColumnMetadata, DataStoreError, Value};
use log::error;
use rust_decimal::Decimal;
use rusqlite::types::{ToSqlOutput, ValueRef};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Row, Statement};

pub fn row_desc_from_stmt(stmt: &Statement) -> Vec<ColumnMetadata> {
    stmt.columns()
        .iter()
        .map(|col| ColumnMetadata::new(col.name(), col.type_().name()))
        .collect()
}

pub fn decode_postgres_rows(rows: Vec<Row>) -> Result<Vec<Vec<Value>>, DataStoreError> {
    rows.iter().map(decode_postgres_row).collect()
}

fn decode_postgres_row(row: &Row) -> Result<Vec<Value>, DataStoreError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_() {
            &Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Boolean),
            &Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into())),
            &Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into())),
            &Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
            &Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into())),
            &Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
            &Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(Value::Decimal),
            &Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME => {
                row.try_get::<_, Option<String>>(idx)?.map(Value::String)
            }
            &Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)?
                .map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
            &Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S").to_string())),
            &Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                .map(|v| Value::String(v.format("%Y-%m-%d %H:%M:%S").to_string())),
            other => {
                error!("Unexpected type {} for column {}", other, column.name());
                return Err(DataStoreError::UnsupportedType(
                    column.name().to_string(),
                    other.name().to_string(),
                ));
            }
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(values)
}

/// Boxes `params` for `tokio_postgres` query calls.
pub fn postgres_params(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    params
        .iter()
        .map(|value| -> Box<dyn ToSql + Sync + Send> {
            match value {
                Value::Null => Box::new(None::<String>),
                Value::Boolean(b) => Box::new(*b),
                Value::Int(i) => Box::new(*i),
                Value::Float(x) => Box::new(*x),
                Value::Decimal(d) => Box::new(*d),
                Value::String(s) => Box::new(s.clone()),
            }
        })
        .collect()
}

pub fn decode_sqlite_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(x) => Value::Float(x),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(x) => ToSqlOutput::from(*x),
            // SQLite has no decimal type; text keeps every digit.
            Value::Decimal(d) => ToSqlOutput::from(d.to_string()),
            Value::String(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_sqlite_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        let params = [
            Value::Null,
            Value::Boolean(true),
            Value::Int(42),
            Value::Float(1.5),
            Value::String("ZUTOMAYO".to_string()),
        ];
        let values: Vec<Value> = conn
            .query_row(
                "SELECT ?1, ?2, ?3, ?4, ?5",
                rusqlite::params_from_iter(params.iter()),
                |row| Ok((0..5).map(|idx| decode_sqlite_value(row.get_ref_unwrap(idx))).collect()),
            )
            .unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Int(1),
                Value::Int(42),
                Value::Float(1.5),
                Value::String("ZUTOMAYO".to_string()),
            ]
        );
    }

    #[test]
    fn test_postgres_params_keep_arity() {
        let decimal = Value::Decimal(Decimal::new(1999, 2));
        assert_eq!(postgres_params(&[Value::Int(1), Value::Null, decimal]).len(), 3);
    }

    #[test]
    fn test_decimal_keeps_precision() {
        let exact = "9007199254740993.000000000001";
        let value = Value::Decimal(exact.parse().unwrap());
        assert_eq!(value.to_string(), exact);

        let conn = Connection::open_in_memory().unwrap();
        let bound: Value = conn
            .query_row("SELECT ?1", [&value], |row| Ok(decode_sqlite_value(row.get_ref_unwrap(0))))
            .unwrap();
        assert_eq!(bound, Value::String(exact.to_string()));
    }
}
