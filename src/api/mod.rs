pub mod model_api;
pub mod simple;
