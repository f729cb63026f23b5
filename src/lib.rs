pub mod ami;
pub mod app;
pub mod config;
pub mod event;
pub mod handler;
pub mod version;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
