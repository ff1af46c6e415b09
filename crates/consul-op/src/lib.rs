//! consul-op - command line access to Consul KV, locks and the service catalog
//!
//! Thin clap front end over [`consul_op_core`].

pub mod cli;
