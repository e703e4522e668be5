#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-runtime** – Runtime layer for Skiff.
//!
//! [`EventStreamWrapper`] binds a typed event stream to a reified
//! projection: it initializes from the snapshot cache plus the log, keeps
//! the projection caught up, and runs optimistic append transactions that
//! retry on write conflicts.
//!
//! [`StateService`] wraps the wrapper in a single-writer loop: every
//! mutation is a job on an ordered queue consumed by one task, readiness is
//! retried forever, and a background timer requests periodic catch-ups.

mod service;
mod wrapper;

pub use service::{ServiceConfig, ServiceError, StateService};
pub use wrapper::{
    AppendError, AppendResult, EventStreamWrapper, Transaction, WrapperConfig, WrapperError,
};
