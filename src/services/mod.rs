pub mod db;
pub mod job;
