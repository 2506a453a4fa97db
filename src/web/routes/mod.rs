pub mod gpu_routes;
