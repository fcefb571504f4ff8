//! Rendezvous tunnel: a public broker parks inbound connections until the agent behind
//! NAT dials back and claims them by key.

pub mod agent;
pub mod broker;
pub mod pipe;
pub mod protocol;
pub mod registry;
