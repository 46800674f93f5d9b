//! # fleet-id
//!
//! Validated name types for the fleet control plane.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels, validated once at the boundary
//! - Every name has a canonical string form with strict parsing
//! - Names roundtrip through serde as plain strings
//! - Names are typed so a tenant can never be passed where an instance is expected
//!
//! ## Application identity
//!
//! An [`ApplicationId`] is the triple `tenant:application:instance`.
//!
//! Examples:
//! - `music:search:default`
//! - `albums:feed:staging`
//!
//! The colon form is the serialized form used as storage keys; the dotted
//! form (`music.search.default`) is what humans and metrics see.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
