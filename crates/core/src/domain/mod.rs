pub mod graph;
pub mod record;
pub mod session;
pub mod unit;
