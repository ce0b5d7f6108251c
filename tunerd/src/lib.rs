//! tunerd: shared broadcast tuner pool with TS/MMT demultiplexing and EPG assembly.
//!
//! - [`ts_analyzer`] / [`mmt`]: Stateless table decoders
//! - [`epg`]: EPG assembler feeding the program store
//! - [`demux`]: Packet filters that select, rewrite and provision packets
//! - [`tuner`]: Tuner devices and the arbiter that shares them
//! - [`catalog`]: In-memory channel, service, program and logo stores

pub mod catalog;
pub mod config;
pub mod demux;
pub mod epg;
pub mod logging;
pub mod metrics;
pub mod mmt;
pub mod ts_analyzer;
pub mod tuner;
