pub mod envelope;
pub mod kv;
pub mod schema;
pub mod state;
pub mod test_utils;
pub mod utils;

pub use envelope::{ApiError, ApiResponse, ApiResult};
pub use state::AppState;
pub use utils::{create_conn, normalize_phone, run_migrations, DbPool};

pub mod prelude {
    pub use super::schema::*;
    pub use super::{ApiError, ApiResponse, ApiResult, AppState, DbPool};

    pub use diesel::prelude::*;
    pub use diesel::{ExpressionMethods, QueryDsl, RunQueryDsl};

    pub use chrono::{DateTime, Utc};
    pub use serde::{Deserialize, Serialize};
    pub use uuid::Uuid;
}
