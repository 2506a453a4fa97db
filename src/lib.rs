pub mod db;
pub mod gpu;
pub mod prometheus;
pub mod server;
pub mod version;
pub mod web;
