//! `revlock` coordinates human review of catalog records.
//!
//! Several reviewers work through the same queue of products, categories and images. Each
//! item a reviewer opens is soft-reserved for a few minutes by writing a `locked_until`
//! timestamp onto the record, so two people do not review the same thing at once. A
//! reservation that is not renewed simply expires.
//!
//! The crate provides:
//! - the reservation manager (claim, extend, release, decide, sweep, queue)
//! - an idle monitor that ends inactive review sessions and releases their item
//! - a record store abstraction with in-memory and shared JSON-file implementations
//! - reviewer identity, short-lived credentials and decision statistics

/// Idle timeout state machine for review sessions.
pub mod activity;
/// Clock abstraction and lease timestamp helpers.
pub mod clock;
/// Timing settings and their validation.
pub mod config;
/// Random identifier generation and item id validation.
pub mod id;
/// Reviewer identity and credentials.
pub mod identity;
/// Reviewable items, filters and patches.
pub mod item;
/// File-based write lock for the JSON store.
pub mod lock;
/// Store directory layout.
pub mod paths;
/// Soft reservations on items.
pub mod reservation;
/// A reviewer's session over the queue.
pub mod session;
/// Decision tallies and queue totals.
pub mod stats;
/// Record store trait and implementations.
pub mod store;
