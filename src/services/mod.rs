pub mod dispatcher;
pub mod file_store;
pub mod lifecycle;
pub mod repository;
pub mod s3;
pub mod status_bus;
pub mod worker;
