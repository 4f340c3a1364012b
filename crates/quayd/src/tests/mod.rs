//! Behavioural suites for the quay daemon.

mod behaviour;
mod support;
