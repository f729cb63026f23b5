pub mod ami;
pub use ami::ami_router;
