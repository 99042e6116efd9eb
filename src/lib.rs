// Library interface for testing

// Declare all modules
pub mod channel;
pub mod clock;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod queries;
pub mod retrieval;
pub mod schema;
pub mod segment_name;
pub mod serve;
pub mod watchdog;

// Re-export the expected database version for convenience
pub use constants::EXPECTED_DB_VERSION;
