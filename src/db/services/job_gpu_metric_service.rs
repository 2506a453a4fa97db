use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, FromQueryResult, Statement, Value,
};
use tracing::debug;

use crate::db::entities::job_gpu_metric;
use crate::db::store::{ClusterOverview, JobMetricStore};
use crate::gpu::JobAggregate;

// Averages are NUMERIC and timestamps are UTC wall-clock TIMESTAMP. Every
// statement below casts on the way in and out so the entity stays f64 / DateTime<Utc>.
const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_gpu_metrics (
    job_id          TEXT PRIMARY KEY,
    avg_utilization NUMERIC NOT NULL DEFAULT 0,
    max_utilization NUMERIC NOT NULL DEFAULT 0,
    min_utilization NUMERIC NOT NULL DEFAULT 0,
    avg_memory_pct  NUMERIC NOT NULL DEFAULT 0,
    max_memory_pct  NUMERIC NOT NULL DEFAULT 0,
    gpu_count       INTEGER NOT NULL DEFAULT 0,
    sample_count    INTEGER NOT NULL DEFAULT 0,
    first_seen      TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    last_seen       TIMESTAMP NOT NULL DEFAULT (NOW() AT TIME ZONE 'UTC'),
    is_complete     BOOLEAN NOT NULL DEFAULT FALSE
)
"#;

const CREATE_ACTIVE_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_job_gpu_metrics_active_last_seen
    ON job_gpu_metrics (last_seen DESC)
    WHERE NOT is_complete
"#;

const SELECT_COLUMNS: &str = r#"
    job_id,
    avg_utilization::float8 AS avg_utilization,
    max_utilization::float8 AS max_utilization,
    min_utilization::float8 AS min_utilization,
    avg_memory_pct::float8  AS avg_memory_pct,
    max_memory_pct::float8  AS max_memory_pct,
    gpu_count,
    sample_count,
    first_seen AT TIME ZONE 'UTC' AS first_seen,
    last_seen AT TIME ZONE 'UTC'  AS last_seen,
    is_complete
"#;

const LATEST_ACTIVE_SEEN_SQL: &str = r#"
SELECT MAX(last_seen) AT TIME ZONE 'UTC' AS last_seen
FROM job_gpu_metrics
WHERE NOT is_complete
"#;

// Must stay in line with `store::merge_record`.
const UPSERT_SQL: &str = r#"
INSERT INTO job_gpu_metrics (
    job_id, avg_utilization, max_utilization, min_utilization,
    avg_memory_pct, max_memory_pct, gpu_count, sample_count,
    first_seen, last_seen, is_complete
)
VALUES (
    $1, $2::float8::numeric, $3::float8::numeric, $4::float8::numeric,
    $5::float8::numeric, $6::float8::numeric, $7, 1,
    $8::timestamptz AT TIME ZONE 'UTC', $8::timestamptz AT TIME ZONE 'UTC', FALSE
)
ON CONFLICT (job_id) DO UPDATE SET
    avg_utilization = (job_gpu_metrics.avg_utilization * job_gpu_metrics.sample_count
                       + EXCLUDED.avg_utilization) / (job_gpu_metrics.sample_count + 1),
    max_utilization = GREATEST(job_gpu_metrics.max_utilization, EXCLUDED.max_utilization),
    min_utilization = LEAST(job_gpu_metrics.min_utilization, EXCLUDED.min_utilization),
    avg_memory_pct  = (job_gpu_metrics.avg_memory_pct * job_gpu_metrics.sample_count
                       + EXCLUDED.avg_memory_pct) / (job_gpu_metrics.sample_count + 1),
    max_memory_pct  = GREATEST(job_gpu_metrics.max_memory_pct, EXCLUDED.max_memory_pct),
    gpu_count       = GREATEST(job_gpu_metrics.gpu_count, EXCLUDED.gpu_count),
    sample_count    = job_gpu_metrics.sample_count + 1,
    last_seen       = EXCLUDED.last_seen,
    is_complete     = FALSE
"#;

const MARK_STALE_COMPLETE_SQL: &str = r#"
UPDATE job_gpu_metrics
SET is_complete = TRUE
WHERE NOT is_complete
  AND last_seen < ($1::timestamptz AT TIME ZONE 'UTC')
"#;

const OVERVIEW_SQL: &str = r#"
SELECT
    AVG(avg_utilization)::float8                                  AS avg_utilization,
    AVG(avg_memory_pct)::float8                                   AS avg_memory_pct,
    SUM(gpu_count)::BIGINT                                        AS total_gpus,
    COUNT(*)                                                      AS total_jobs,
    COUNT(*) FILTER (WHERE avg_utilization < $3::float8::numeric) AS underutilized_jobs
FROM job_gpu_metrics
WHERE first_seen <= ($2::timestamptz AT TIME ZONE 'UTC')
  AND last_seen >= ($1::timestamptz AT TIME ZONE 'UTC')
"#;

/// `$1` is the staleness cutoff, `$2..` the job ids seen in the current cycle.
fn mark_stale_complete_sql(active_jobs: usize) -> String {
    if active_jobs == 0 {
        return MARK_STALE_COMPLETE_SQL.to_string();
    }
    let placeholders: Vec<String> = (2..active_jobs + 2).map(|i| format!("${i}")).collect();
    format!(
        "{MARK_STALE_COMPLETE_SQL}  AND job_id NOT IN ({})\n",
        placeholders.join(", ")
    )
}

fn find_job_sql() -> String {
    format!("SELECT {SELECT_COLUMNS} FROM job_gpu_metrics WHERE job_id = $1")
}

const COLUMN_TYPES_SQL: &str = r#"
SELECT column_name::text AS column_name, data_type::text AS data_type
FROM information_schema.columns
WHERE table_schema = current_schema() AND table_name = 'job_gpu_metrics'
"#;

const TIMESTAMP_COLUMNS: [&str; 2] = ["first_seen", "last_seen"];
const STAT_COLUMNS: [&str; 5] = [
    "avg_utilization",
    "max_utilization",
    "min_utilization",
    "avg_memory_pct",
    "max_memory_pct",
];

#[derive(FromQueryResult, Debug)]
struct ColumnTypeRow {
    column_name: String,
    data_type: String,
}

/// Creates the `job_gpu_metrics` table and its index when they are missing,
/// then refuses a pre-existing table whose column types the queries cannot read.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    db.execute_unprepared(CREATE_TABLE_SQL).await?;
    db.execute_unprepared(CREATE_ACTIVE_INDEX_SQL).await?;

    let columns = ColumnTypeRow::find_by_statement(Statement::from_string(
        DbBackend::Postgres,
        COLUMN_TYPES_SQL,
    ))
    .all(db)
    .await?;
    check_column_types(
        columns
            .iter()
            .map(|c| (c.column_name.as_str(), c.data_type.as_str())),
    )
}

fn check_column_types<'a>(columns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<(), DbErr> {
    let mut problems = Vec::new();
    for (name, data_type) in columns {
        let ok = if TIMESTAMP_COLUMNS.contains(&name) {
            data_type == "timestamp without time zone"
        } else if STAT_COLUMNS.contains(&name) {
            matches!(data_type, "numeric" | "double precision")
        } else {
            true
        };
        if !ok {
            problems.push(format!("{name} is {data_type}"));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DbErr::Custom(format!(
            "job_gpu_metrics has unsupported column types: {}",
            problems.join(", ")
        )))
    }
}

#[derive(FromQueryResult, Debug)]
struct LatestSeenRow {
    last_seen: Option<DateTime<Utc>>,
}

/// Helper struct for the overview aggregate query
#[derive(FromQueryResult, Debug)]
struct OverviewRow {
    avg_utilization: Option<f64>,
    avg_memory_pct: Option<f64>,
    total_gpus: Option<i64>,
    total_jobs: i64,
    underutilized_jobs: i64,
}

/// `JobMetricStore` backed by the Postgres `job_gpu_metrics` table.
#[derive(Clone, Debug)]
pub struct PgJobMetricStore {
    db: DatabaseConnection,
}

impl PgJobMetricStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobMetricStore for PgJobMetricStore {
    async fn latest_active_seen(&self) -> Result<Option<DateTime<Utc>>, DbErr> {
        let row = LatestSeenRow::find_by_statement(Statement::from_string(
            DbBackend::Postgres,
            LATEST_ACTIVE_SEEN_SQL,
        ))
        .one(&self.db)
        .await?;
        Ok(row.and_then(|row| row.last_seen))
    }

    async fn upsert_job(
        &self,
        job_id: &str,
        cycle: &JobAggregate,
        now: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        let statement = Statement::from_sql_and_values(
            DbBackend::Postgres,
            UPSERT_SQL,
            [
                job_id.into(),
                cycle.avg_utilization.into(),
                cycle.max_utilization.into(),
                cycle.min_utilization.into(),
                cycle.avg_memory_pct.into(),
                cycle.max_memory_pct.into(),
                cycle.gpu_count.into(),
                now.into(),
            ],
        );
        self.db.execute(statement).await?;
        debug!(job_id = %job_id, gpu_count = cycle.gpu_count, "Upserted job GPU metrics.");
        Ok(())
    }

    async fn mark_stale_complete(
        &self,
        active_job_ids: &[String],
        stale_before: DateTime<Utc>,
    ) -> Result<u64, DbErr> {
        let mut values: Vec<Value> = Vec::with_capacity(active_job_ids.len() + 1);
        values.push(stale_before.into());
        values.extend(active_job_ids.iter().map(|id| Value::from(id.as_str())));
        let result = self
            .db
            .execute(Statement::from_sql_and_values(
                DbBackend::Postgres,
                mark_stale_complete_sql(active_job_ids.len()),
                values,
            ))
            .await?;
        Ok(result.rows_affected())
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<job_gpu_metric::Model>, DbErr> {
        job_gpu_metric::Model::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            find_job_sql(),
            [job_id.into()],
        ))
        .one(&self.db)
        .await
    }

    async fn overview(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        underutilized_threshold: f64,
    ) -> Result<ClusterOverview, DbErr> {
        let row = OverviewRow::find_by_statement(Statement::from_sql_and_values(
            DbBackend::Postgres,
            OVERVIEW_SQL,
            [from.into(), to.into(), underutilized_threshold.into()],
        ))
        .one(&self.db)
        .await?;

        Ok(match row {
            Some(row) => ClusterOverview {
                avg_utilization: row.avg_utilization.unwrap_or(0.0),
                avg_memory_pct: row.avg_memory_pct.unwrap_or(0.0),
                total_gpus: row.total_gpus.unwrap_or(0),
                total_jobs: row.total_jobs,
                underutilized_jobs: row.underutilized_jobs,
            },
            None => ClusterOverview::default(),
        })
    }
}
