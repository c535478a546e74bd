pub mod batch;
pub mod cli;
pub mod config;
pub mod device;
pub mod network;
pub mod reachability;
pub mod sequence;
pub mod storage;
