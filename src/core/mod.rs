pub mod error;
pub mod video;
