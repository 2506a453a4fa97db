pub mod gpu_models;
