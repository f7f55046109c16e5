pub mod aggregate;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod model;
pub mod portal;
pub mod reconcile;
pub mod sync;
