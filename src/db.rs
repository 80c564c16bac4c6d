use std::path::Path;

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
    pub db: Surreal<Db>,
}

/// Open the on-disk database under `data_dir` and run migrations.
pub async fn init(data_dir: &Path) -> Result<DbHandle, surrealdb::Error> {
    let db = Surreal::new::<SurrealKv>(data_dir.join("shotsync.db")).await?;
    prepare(db).await
}

/// In-memory database for tests.
pub async fn init_memory() -> Result<DbHandle, surrealdb::Error> {
    let db = Surreal::new::<Mem>(()).await?;
    prepare(db).await
}

async fn prepare(db: Surreal<Db>) -> Result<DbHandle, surrealdb::Error> {
    db.use_ns("shotsync").use_db("shotsync").await?;
    run_migrations(&db).await?;
    Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), surrealdb::Error> {
    db.query(SCHEMA_V1).await?.check()?;
    Ok(())
}

// Timestamps are epoch milliseconds.
const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE production_record SCHEMAFULL;
    DEFINE FIELD OVERWRITE local_id ON production_record TYPE int;
    DEFINE FIELD OVERWRITE peer_id ON production_record TYPE option<int>;
    DEFINE FIELD OVERWRITE animator ON production_record TYPE string;
    DEFINE FIELD OVERWRITE project_type ON production_record TYPE string;
    DEFINE FIELD OVERWRITE title ON production_record TYPE string;
    DEFINE FIELD OVERWRITE scene ON production_record TYPE string;
    DEFINE FIELD OVERWRITE shot ON production_record TYPE string;
    DEFINE FIELD OVERWRITE week_code ON production_record TYPE string;
    DEFINE FIELD OVERWRITE status ON production_record TYPE string;
    DEFINE FIELD OVERWRITE notes ON production_record TYPE option<string>;
    DEFINE FIELD OVERWRITE last_synced_at ON production_record TYPE option<int>;
    DEFINE FIELD OVERWRITE updated_at ON production_record TYPE int;
    DEFINE INDEX OVERWRITE idx_record_local_id ON production_record FIELDS local_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_record_identity ON production_record FIELDS project_type, title, scene, shot UNIQUE;
    DEFINE INDEX OVERWRITE idx_record_peer_id ON production_record FIELDS peer_id;

    DEFINE TABLE OVERWRITE sync_log SCHEMAFULL;
    DEFINE FIELD OVERWRITE seq ON sync_log TYPE int;
    DEFINE FIELD OVERWRITE at ON sync_log TYPE int;
    DEFINE FIELD OVERWRITE direction ON sync_log TYPE string;
    DEFINE FIELD OVERWRITE record_ids ON sync_log TYPE array<int>;
    DEFINE FIELD OVERWRITE action ON sync_log TYPE string;
    DEFINE FIELD OVERWRITE outcome ON sync_log TYPE string;
    DEFINE FIELD OVERWRITE severity ON sync_log TYPE string;
    DEFINE FIELD OVERWRITE error ON sync_log TYPE option<string>;
    DEFINE FIELD OVERWRITE payload ON sync_log TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_sync_log_seq ON sync_log FIELDS seq UNIQUE;

    DEFINE TABLE OVERWRITE sequence SCHEMAFULL;
    DEFINE FIELD OVERWRITE counter ON sequence TYPE int DEFAULT 0;
";
