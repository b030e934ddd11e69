//! # I/O Module
//!
//! Persistence boundary. Converts between the on-disk hierarchy and in-memory
//! `Element` values.
//!
//! - `store`: directory-backed containers, attributes, locking, atomic replace
//! - `array_file`: single-file typed n-d arrays with memory-mapped range reads
//! - `codec`: tagged encoding of every element kind onto the store

pub mod array_file;
pub mod codec;
pub mod store;

pub use array_file::Dataset;
pub use codec::{create_mapping_group, decode, decode_rows, encode, inspect, ElementInfo};
pub use store::{Attributes, Group, Node, StagedGroup, Store};
