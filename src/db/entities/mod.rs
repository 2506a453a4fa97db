//! SeaORM entities that map to database tables.

pub mod job_gpu_metric;
