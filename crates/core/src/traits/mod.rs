pub mod repository;
pub mod submitter;

pub use repository::*;
pub use submitter::*;
