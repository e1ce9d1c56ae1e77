//! Shared encode/decode and id allocation helpers.

use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

// Counter table: key = entity name, value = last allocated id
pub(crate) const META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("meta_counters");

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Allocate the next id for `entity` inside an open write transaction.
pub(crate) fn next_id(
    table: &mut redb::Table<'_, &str, i64>,
    entity: &str,
) -> Result<i64> {
    let current = table.get(entity)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(entity, next)?;
    Ok(next)
}
