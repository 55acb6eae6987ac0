pub mod recognition;
pub mod registry;
pub mod storage;
