//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [load balancing](load_balancing), choosing the hosts a request is sent to,
//! - [retries](retry) after server-reported timeouts and unavailability,
//! - [reconnection](reconnection) schedules,
//! - [address resolution](address_resolution) of peers,
//! - [client-side timestamps](timestamp_generator),
//! - [host listeners](host_listener), notified about topology changes.

pub mod address_resolution;
pub mod host_listener;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod timestamp_generator;
