pub mod blob;
pub mod content_id;
pub mod error;
