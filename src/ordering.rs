//! Standard memory orderings for concurrent page access.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading page fields during latch-free traversal.
/// Pairs with writers' Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing page fields under the node latch.
/// Pairs with readers' Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for loads that are already serialized by a held latch.
pub const RELAXED: Ordering = Ordering::Relaxed;
