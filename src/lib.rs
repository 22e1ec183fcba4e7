#[macro_use] extern crate diesel;
#[macro_use] extern crate diesel_migrations;

pub mod api;
pub mod cleanup;
pub mod conf;
pub mod db;
pub mod errors;
pub mod gate;
pub mod issuer;
pub mod json_store;
pub mod object_store;
pub mod rate_limit;
pub mod schema;
pub mod store;
pub mod token;
pub mod tracker;
