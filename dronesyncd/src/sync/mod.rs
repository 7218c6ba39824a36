pub mod error;
pub mod media;
pub mod paths;
pub mod queue;
pub mod quota;
pub mod transfer;
pub mod worker;
