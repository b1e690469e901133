//! Frontdesk — multi-tenant customer-communication core for studios.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod guardrail;
pub mod ingress;
pub mod normalize;
pub mod outbound;
pub mod pipeline;
pub mod router;
pub mod session;
pub mod tenant;

pub use error::{Error, Result};
