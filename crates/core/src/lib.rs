//! `stocklock-core` — foundation building blocks for the stock engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the caller-supplied principal, and the business
//! error model with stable machine-readable codes.

pub mod error;
pub mod id;
pub mod principal;

pub use error::{ErrorCode, StockError, StockResult};
pub use id::{ActorId, EntryId, ProductId, ReservationId};
pub use principal::Principal;
