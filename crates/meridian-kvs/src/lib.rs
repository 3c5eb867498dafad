//! # meridian-kvs
//!
//! Key-value service abstraction for Meridian.
//!
//! Every durable byte Meridian stores goes through the [`KeyValueService`]
//! trait: transaction data, commit records, timestamp bounds, persisted
//! locks, and sweep progress. The trait models a multi-version cell store
//! with no transactional guarantees of its own beyond single-cell
//! atomicity and an optional check-and-set primitive; the transaction
//! protocol layers snapshot isolation on top.
//!
//! # Components
//!
//! - [`api`]: the service trait plus the request and schema types
//! - [`cas`]: translation of check-and-set requests into executable plans
//! - [`memory`]: a fully featured in-memory engine used by tests and
//!   single-node deployments
//!
//! # Example
//!
//! ```
//! use meridian_common::types::{Cell, TableRef, Timestamp, Value};
//! use meridian_kvs::{InMemoryKeyValueService, KeyValueService, TableSchema};
//!
//! let kvs = InMemoryKeyValueService::new();
//! let table = TableRef::create("app", "profile").unwrap();
//! kvs.create_table(&table, &TableSchema::default()).unwrap();
//!
//! let cell = Cell::new("user1", "name");
//! kvs.put(&table, &[(cell.clone(), Value::from_bytes(b"alice"))], Timestamp::new(10))
//!     .unwrap();
//!
//! let read = kvs.get(&table, &cell, Timestamp::new(20)).unwrap().unwrap();
//! assert_eq!(read.value.as_bytes(), b"alice");
//! assert_eq!(read.ts, Timestamp::new(10));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod cas;
pub mod memory;

pub use api::{
    validate_write, CandidateBatch, CandidateCell, CandidateCellsRequest, CheckAndSetRequest,
    ColumnUpdate, ConflictHandler, KeyValueService, SweepStrategy, TableSchema, VersionedValue,
};
pub use cas::{plan_check_and_set, CasCondition, CasOp, CasPlan};
pub use memory::{InMemoryKeyValueService, KvsStats};
