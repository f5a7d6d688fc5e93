// storage/mod.rs
// Database operations module

pub mod migrations;
pub mod pool;
#[cfg(test)]
pub mod test_helpers;

// Re-export commonly used items
pub use migrations::run_migrations;
pub use pool::{init_db_pool, init_db_pool_with_path};
