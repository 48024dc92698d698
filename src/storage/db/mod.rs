//! Database backend.
//!
//! SQLite through sqlx. All access goes through [`SqlitePool`]:
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/heatwatch.db").await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::{DEFAULT_MAX_CONNECTIONS, SqlitePool};
