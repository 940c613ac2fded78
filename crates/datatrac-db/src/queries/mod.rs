pub mod data_sources;
pub mod tasks;
pub mod unit_configs;
pub mod unit_histories;
pub mod unit_runtimes;
