use crate::core::config::DatabaseConfig;
use diesel::{
    r2d2::{ConnectionManager, Pool},
    PgConnection,
};
use std::time::Duration;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn(config: &DatabaseConfig) -> Result<DbPool, diesel::r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(&config.url);
    Pool::builder()
        .max_size(config.max_connections.max(1))
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
}

/// Run database migrations
pub fn run_migrations(pool: &DbPool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> {
            format!("Migration error: {e}").into()
        })?;
    Ok(())
}

/// Digits only, last ten. Country prefixes and punctuation drop out so
/// "+1 (555) 010-2030" and "5550102030" compare equal.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let skip = digits.len().saturating_sub(10);
    digits[skip..].to_string()
}

/// Lowercase, alphanumerics and single hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_phone_numbers() {
        assert_eq!(normalize_phone("+1 (555) 010-2030"), "5550102030");
        assert_eq!(normalize_phone("555.010.2030"), "5550102030");
        assert_eq!(normalize_phone("12"), "12");
        assert_eq!(normalize_phone("n/a"), "");
    }

    #[test]
    fn slugifies_names() {
        assert_eq!(slugify("Acme Realty, LLC"), "acme-realty-llc");
        assert_eq!(slugify("  --Top Dog--  "), "top-dog");
    }
}
