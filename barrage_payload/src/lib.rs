//! Request payloads for barrage.
//!
//! This library synthesizes the randomized requests a barrage virtual user
//! sends: a kind drawn from a weighted mix, entities drawn from bounded
//! domains and optional fields kept by a fair coin. Everything here is a
//! pure function of a caller-supplied random source, so a seeded
//! `SmallRng` reproduces any sequence of requests exactly.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use rustc_hash::FxHashMap;
use serde::Serialize;

pub mod domain;
pub mod sparse;
pub mod weighted;
pub mod workload;

pub use workload::{RequestKind, Workload};

/// HTTP methods barrage sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl Method {
    /// The method as written on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// A fully synthesized request, ready for dispatch.
///
/// The target base URI is not carried here. The dispatcher joins it with
/// [`RequestSpec::path_and_query`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSpec {
    /// What was synthesized
    pub kind: RequestKind,
    /// HTTP method
    pub method: Method,
    /// Absolute path, never empty
    pub path: &'static str,
    /// Header name to value
    pub headers: FxHashMap<String, String>,
    /// Included query pairs, possibly none
    pub query: sparse::QueryString,
    /// JSON body for POST requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<sparse::JsonBody>,
}

impl RequestSpec {
    /// The path followed by the rendered query string, if any.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        format!("{path}{query}", path = self.path, query = self.query)
    }
}
