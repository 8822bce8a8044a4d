//! Shared domain types for the Switchyard gateway
//!
//! Entities, error kinds, the request-scoped session, and the
//! change-notification envelope exchanged between instances.

#![allow(clippy::must_use_candidate)]

pub mod clock;
mod context;
pub mod entity;
mod error;
mod notify;

pub use context::{Exclusion, RequestScope, Session};
pub use entity::{
    App, AppKey, Corp, Entity, EntityKind, Fallback, Group, Key, LbStrategy, Model, ModelAgent, Pricing, Provider,
    QuotaHolder, Reseller, Status, User,
};
pub use error::{GatewayError, HttpError};
pub use notify::{ChangeAction, ChangeMessage, Channel};
