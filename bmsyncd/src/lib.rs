pub mod accounts;
pub mod daemon;
pub mod db;
pub mod sync;
