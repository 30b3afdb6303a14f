#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Parameter canonicalization and build fingerprinting for `cadgate`.
//!
//! Turning a raw query string into a [`BuildRequest`] is a single total
//! pipeline: group dotted keys, coerce values to their native type, sort
//! everything, digest. Equal canonical forms produce equal fingerprints by
//! construction.

mod fingerprint;
mod params;

pub use fingerprint::{Assembly, BuildRequest, BuildTarget, Fingerprint};
pub use params::{DEFAULT_ALLOWED_GROUPS, ParamError, ParamGroups, ParamValue, parse_query_pairs};
