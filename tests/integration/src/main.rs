//! Multi-node scenarios for the cluster bus, run in one process over
//! in-memory links. Everything here runs under `cargo test`.

#[cfg(test)]
mod helpers;

#[cfg(test)]
mod failover;
#[cfg(test)]
mod membership;

fn main() {}
