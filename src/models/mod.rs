pub mod descriptor;
pub mod job;
pub mod summary;
