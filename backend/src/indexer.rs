pub(crate) mod checkpoint;
pub(crate) mod db;
pub(crate) mod decoder;
pub(crate) mod engine;
pub(crate) mod errors;
pub(crate) mod models;
pub(crate) mod points;
pub(crate) mod source;
pub(crate) mod types;
