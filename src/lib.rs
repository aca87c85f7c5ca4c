//! Order creation on top of an ambient unit-of-work transaction manager.
//!
//! `TransactionManager::run` binds an open transaction into a [`Context`];
//! repositories resolve their query engine from that context, so an order
//! row and its outbox row are written atomically without passing a
//! transaction handle around.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
pub mod transaction;
pub mod usecase;
pub mod utils;

pub use config::{AppConfig, ConfigError};
pub use context::Context;
pub use error::{Error, ErrorKind};
pub use transaction::{QueryEngineProvider, TransactionError, TransactionManager};
pub use usecase::{CreateOrderInfo, OrdersUsecase};
