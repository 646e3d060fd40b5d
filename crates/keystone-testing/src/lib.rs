//! Test fixtures for keystone.
//!
//! Provides [`DeterministicCoordinationClient`], an in-memory implementation
//! of [`keystone_traits::CoordinationClient`] with real version semantics,
//! watches and failure injection. It stands in for a coordination ensemble in
//! unit, integration and property tests.

mod deterministic;

pub use deterministic::DeterministicCoordinationClient;
