//! Address management.
//!
//! This module provides:
//! - The address book pools draw candidates from
//! - Network group classification
//! - The two peer selection policies

pub mod book;
pub mod group;
pub mod selector;

pub use book::{AddressBook, AddressEntry};
pub use group::{is_unroutable, NetworkGroup};
pub use selector::GroupSelector;
