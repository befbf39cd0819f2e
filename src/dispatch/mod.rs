//! The event dispatch worker.

mod backoff;
pub mod broker;
mod queue;
mod worker;

pub use broker::EventBroker;
pub use queue::EventQueue;
pub use worker::DispatchWorker;
