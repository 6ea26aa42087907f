//! Lead buckets: named lists of leads, usually filled from an uploaded CSV.
//! Uploaded files are kept in object storage next to the imported rows.

pub mod csv_import;
#[cfg(feature = "drive")]
pub mod s3;

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::shared::schema::{lead_buckets, leads};
use crate::core::shared::{ApiError, ApiResponse, ApiResult, AppState};
use crate::core::tenant::TeamContext;
use crate::leads::{import_leads, ImportSummary};
use crate::sdr::record_event;
use csv_import::parse_leads_csv;

/// Upload ceiling for a single CSV.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid CSV: {0}")]
    Csv(String),
    #[error("upload has no file field")]
    MissingFile,
    #[error("file exceeds the 20 MB upload limit")]
    TooLarge,
}

impl From<DriveError> for ApiError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::NotFound(_) => Self::NotFound(err.to_string()),
            DriveError::Storage(_) => Self::Upstream(err.to_string()),
            DriveError::Csv(_) | DriveError::MissingFile | DriveError::TooLarge => {
                Self::BadRequest(err.to_string())
            }
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), DriveError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, DriveError>;

    async fn delete(&self, key: &str) -> Result<(), DriveError>;
}

/// Keeps the last path segment and replaces anything outside
/// `[A-Za-z0-9._-]`.
pub fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.csv".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn storage_key(team_id: Uuid, bucket_id: Uuid, file_name: &str) -> String {
    format!(
        "teams/{team_id}/buckets/{bucket_id}/{}",
        safe_file_name(file_name)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = lead_buckets)]
pub struct LeadBucket {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub source: Option<String>,
    pub lead_count: i32,
    pub storage_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
    pub description: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = lead_buckets)]
pub struct UpdateBucketRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadSummary {
    pub bucket: LeadBucket,
    pub storage_key: String,
    pub rows: usize,
    pub import: ImportSummary,
    pub ignored_headers: Vec<String>,
    pub malformed_rows: usize,
}

fn find_bucket(conn: &mut PgConnection, team_id: Uuid, id: Uuid) -> Result<LeadBucket, ApiError> {
    lead_buckets::table
        .filter(lead_buckets::id.eq(id))
        .filter(lead_buckets::team_id.eq(team_id))
        .select(LeadBucket::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| ApiError::not_found("bucket"))
}

/// Recounts the bucket's leads from the table rather than trusting the
/// import tally, since re-imported rows may already belong to it.
fn refresh_lead_count(conn: &mut PgConnection, bucket_id: Uuid) -> Result<i32, ApiError> {
    let count: i64 = leads::table
        .filter(leads::bucket_id.eq(bucket_id))
        .count()
        .get_result(conn)?;
    let count = i32::try_from(count).unwrap_or(i32::MAX);
    diesel::update(lead_buckets::table.filter(lead_buckets::id.eq(bucket_id)))
        .set((
            lead_buckets::lead_count.eq(count),
            lead_buckets::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(count)
}

pub async fn list_buckets(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
) -> ApiResult<Vec<LeadBucket>> {
    let mut conn = state.conn.get()?;
    let rows = lead_buckets::table
        .filter(lead_buckets::team_id.eq(ctx.team_id))
        .order(lead_buckets::created_at.desc())
        .select(LeadBucket::as_select())
        .load(&mut conn)?;
    Ok(ApiResponse::ok(rows))
}

pub async fn get_bucket(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<LeadBucket> {
    let mut conn = state.conn.get()?;
    Ok(ApiResponse::ok(find_bucket(&mut conn, ctx.team_id, id)?))
}

pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Json(req): Json<CreateBucketRequest>,
) -> ApiResult<LeadBucket> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let now = Utc::now();
    let bucket = LeadBucket {
        id: Uuid::new_v4(),
        team_id: ctx.team_id,
        name: name.to_string(),
        description: req.description,
        source: req.source,
        lead_count: 0,
        storage_key: None,
        created_at: now,
        updated_at: now,
    };

    let mut conn = state.conn.get()?;
    let saved = diesel::insert_into(lead_buckets::table)
        .values(&bucket)
        .returning(LeadBucket::as_returning())
        .get_result(&mut conn)?;
    Ok(ApiResponse::created(saved))
}

pub async fn update_bucket(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateBucketRequest>,
) -> ApiResult<LeadBucket> {
    if req.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("name must not be blank"));
    }
    let mut conn = state.conn.get()?;
    find_bucket(&mut conn, ctx.team_id, id)?;
    if req.name.is_none() && req.description.is_none() && req.source.is_none() {
        return Ok(ApiResponse::ok(find_bucket(&mut conn, ctx.team_id, id)?));
    }
    let saved = diesel::update(lead_buckets::table.filter(lead_buckets::id.eq(id)))
        .set((&req, lead_buckets::updated_at.eq(Utc::now())))
        .returning(LeadBucket::as_returning())
        .get_result(&mut conn)?;
    Ok(ApiResponse::ok(saved))
}

#[derive(Debug, Serialize)]
pub struct DeletedBucket {
    pub id: Uuid,
    pub deleted: bool,
}

/// Leads stay; the foreign key nulls their `bucket_id`.
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
) -> ApiResult<DeletedBucket> {
    let bucket = {
        let mut conn = state.conn.get()?;
        let bucket = find_bucket(&mut conn, ctx.team_id, id)?;
        diesel::delete(lead_buckets::table.filter(lead_buckets::id.eq(id))).execute(&mut conn)?;
        bucket
    };

    if let (Some(store), Some(key)) = (state.drive.as_deref(), bucket.storage_key.as_deref()) {
        if let Err(e) = store.delete(key).await {
            warn!("Bucket {id} deleted but {key} was left in storage: {e}");
        }
    }
    Ok(ApiResponse::ok(DeletedBucket { id, deleted: true }))
}

async fn read_file(multipart: &mut Multipart) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload.csv").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("could not read upload: {e}")))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(DriveError::TooLarge.into());
        }
        return Ok((file_name, bytes.to_vec()));
    }
    Err(DriveError::MissingFile.into())
}

pub async fn upload_bucket_csv(
    State(state): State<Arc<AppState>>,
    ctx: TeamContext,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> ApiResult<UploadSummary> {
    let store = state
        .drive
        .as_deref()
        .ok_or(ApiError::NotConfigured("object storage"))?;

    let bucket = {
        let mut conn = state.conn.get()?;
        find_bucket(&mut conn, ctx.team_id, id)?
    };

    let (file_name, bytes) = read_file(&mut multipart).await?;
    let parsed = parse_leads_csv(&bytes)?;
    let key = storage_key(ctx.team_id, bucket.id, &file_name);
    store.put(&key, bytes, "text/csv").await?;

    let rows = parsed.rows.len();
    let mut conn = state.conn.get()?;
    let source = bucket.source.clone().unwrap_or_else(|| "csv".to_string());
    let import = import_leads(&mut conn, ctx.team_id, parsed.rows, Some(&source), Some(bucket.id))?;
    refresh_lead_count(&mut conn, bucket.id)?;
    diesel::update(lead_buckets::table.filter(lead_buckets::id.eq(bucket.id)))
        .set(lead_buckets::storage_key.eq(&key))
        .execute(&mut conn)?;
    let bucket = find_bucket(&mut conn, ctx.team_id, bucket.id)?;

    record_event(
        &mut conn,
        ctx.team_id,
        None,
        "bucket.import",
        &format!(
            "Imported {} new and {} updated leads into {}",
            import.inserted, import.updated, bucket.name
        ),
        serde_json::json!({ "bucket_id": bucket.id, "file": key }),
    )?;
    info!(
        "Bucket {} upload {}: {} rows, {} inserted, {} updated, {} skipped",
        bucket.id, key, rows, import.inserted, import.updated, import.skipped
    );

    Ok(ApiResponse::ok(UploadSummary {
        bucket,
        storage_key: key,
        rows,
        import,
        ignored_headers: parsed.ignored_headers,
        malformed_rows: parsed.malformed_rows,
    }))
}

pub fn configure_bucket_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/buckets", get(list_buckets).post(create_bucket))
        .route(
            "/api/buckets/:id",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        .route(
            "/api/buckets/:id/upload",
            post(upload_bucket_csv).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024)),
        )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: RwLock<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), DriveError> {
            self.objects.write().await.insert(key.to_string(), bytes);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, DriveError> {
            self.objects
                .read()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| DriveError::NotFound(key.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), DriveError> {
            self.objects.write().await.remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    #[test]
    fn keys_are_scoped_and_sanitised() {
        let team = Uuid::nil();
        let bucket = Uuid::from_u128(7);
        assert_eq!(
            storage_key(team, bucket, "../../etc/Austin roofers (May).csv"),
            format!("teams/{team}/buckets/{bucket}/Austin_roofers__May_.csv")
        );
        assert_eq!(safe_file_name("C:\\exports\\list.csv"), "list.csv");
        assert_eq!(safe_file_name("..."), "upload.csv");
    }

    #[test]
    fn drive_errors_map_to_statuses() {
        use axum::http::StatusCode;
        assert_eq!(ApiError::from(DriveError::TooLarge).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(DriveError::NotFound("k".into())).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(DriveError::Storage("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn memory_store_round_trips_objects() {
        let store = MemoryStore::default();
        store.put("teams/a/b.csv", b"phone\n1".to_vec(), "text/csv").await.unwrap();
        assert_eq!(store.get("teams/a/b.csv").await.unwrap(), b"phone\n1");
        store.delete("teams/a/b.csv").await.unwrap();
        assert!(matches!(store.get("teams/a/b.csv").await, Err(DriveError::NotFound(_))));
    }
}
