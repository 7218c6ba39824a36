pub mod daemon;
pub mod manager;
pub mod sync;
