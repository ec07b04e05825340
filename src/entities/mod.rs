pub mod job;
pub mod processing_file;
