//! Idempotent bootstrap of the redsocial MongoDB database: the administrative
//! user, the collections and their secondary indexes.
pub mod conf;
pub mod db;
pub mod provision;
pub mod schema;
pub mod utils;

pub use db::{Backend, BackendError, Creation, MongoBackend};
pub use provision::{Drift, ProvisionError, ProvisionReport, provision, verify};
pub use schema::{AdminUser, CollectionSpec, Direction, IndexSpec, Schema};
