use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Running GPU statistics of one Slurm job, folded over capture cycles.
///
/// Stored as NUMERIC and UTC `TIMESTAMP`; `PgJobMetricStore` casts to `float8`
/// and `timestamptz` when reading.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_gpu_metrics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: String,
    #[sea_orm(column_type = "Decimal(None)")]
    pub avg_utilization: f64,
    #[sea_orm(column_type = "Decimal(None)")]
    pub max_utilization: f64,
    #[sea_orm(column_type = "Decimal(None)")]
    pub min_utilization: f64,
    #[sea_orm(column_type = "Decimal(None)")]
    pub avg_memory_pct: f64,
    #[sea_orm(column_type = "Decimal(None)")]
    pub max_memory_pct: f64,
    pub gpu_count: i32,
    /// Number of capture cycles folded into the averages.
    pub sample_count: i32,
    #[sea_orm(column_type = "DateTime")]
    pub first_seen: ChronoDateTimeUtc,
    #[sea_orm(column_type = "DateTime")]
    pub last_seen: ChronoDateTimeUtc,
    pub is_complete: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
