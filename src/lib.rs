//! Attestation-backed trusted host filtering.
//!
//! Decides, per scheduling candidate, whether a host meets a request's trust
//! requirement. Host trust comes from a remote attestation authority and is
//! cached for a configurable window so one query serves many decisions.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attestation;
pub mod cache;
pub mod config;
pub mod logging;
pub mod policy;
pub mod tags;
pub mod types;
