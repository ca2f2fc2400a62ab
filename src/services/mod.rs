pub mod catalog;
pub mod distance;
pub mod ors;
pub mod retry;
pub mod routing;
pub mod streaming;
