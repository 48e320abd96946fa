//! Proxy candidates and everything attached to them
//!
//! This module provides functionality for:
//! - The candidate and node model shared by every stage
//! - Loading candidate lists from JSON or Clash-style YAML
//! - Entry-name sanitizing and final country-indexed renaming
//! - IP geolocation with an on-disk cache

pub mod geo;
pub mod models;
pub mod naming;
pub mod parser;

pub use geo::{CachedGeoLookup, GeoCache, GeoLocation, GeoLocator, GeoLookup, IpApiLookup};
pub use models::{
    dedup_candidates, Candidate, CandidateKey, Node, Protocol, ProtocolKind, StageResult,
    TlsOptions, Transport,
};
pub use naming::NodeRenamer;
pub use parser::{CandidateParser, ParseReport};
