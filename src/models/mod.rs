pub mod bill;
pub mod job;
pub mod report;
pub mod registry;
