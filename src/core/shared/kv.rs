//! JSON blobs keyed by string, scoped to a team. Writes are upserts and the
//! last write wins.

use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::envelope::ApiError;
use super::schema::kv_store;

pub fn kv_get<T: DeserializeOwned>(
    conn: &mut PgConnection,
    team_id: Uuid,
    key: &str,
) -> Result<Option<T>, ApiError> {
    let value: Option<serde_json::Value> = kv_store::table
        .filter(kv_store::key.eq(key))
        .filter(kv_store::team_id.eq(team_id))
        .select(kv_store::value)
        .first(conn)
        .optional()?;

    match value {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub fn kv_put<T: Serialize>(
    conn: &mut PgConnection,
    team_id: Uuid,
    key: &str,
    value: &T,
) -> Result<(), ApiError> {
    let json = serde_json::to_value(value)?;
    let now = Utc::now();

    diesel::insert_into(kv_store::table)
        .values((
            kv_store::key.eq(key),
            kv_store::team_id.eq(team_id),
            kv_store::value.eq(&json),
            kv_store::updated_at.eq(now),
        ))
        .on_conflict(kv_store::key)
        .do_update()
        .set((kv_store::value.eq(&json), kv_store::updated_at.eq(now)))
        .execute(conn)?;
    Ok(())
}

pub fn kv_delete(conn: &mut PgConnection, team_id: Uuid, key: &str) -> Result<bool, ApiError> {
    let deleted = diesel::delete(
        kv_store::table
            .filter(kv_store::key.eq(key))
            .filter(kv_store::team_id.eq(team_id)),
    )
    .execute(conn)?;
    Ok(deleted > 0)
}
