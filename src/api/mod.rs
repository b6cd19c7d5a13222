pub mod auth;
pub mod db;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod types;
pub mod vault;
pub mod webhook;
