//! Single-threaded MQTT 3.1.1 broker.
//!
//! [`broker::Broker`] owns one listening socket and a bounded table of
//! [`session::Session`]s, all driven from a single `mio`-polled event loop
//! (§4.7, §5 of the design). [`router`] and [`retained`] implement the
//! cross-session concerns a single session can't resolve on its own.

pub mod broker;
pub mod error;
pub mod limits;
pub mod retained;
pub mod router;
pub mod session;
pub mod topic;

pub use broker::Broker;
pub use error::BrokerError;
