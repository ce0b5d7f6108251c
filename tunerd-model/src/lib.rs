//! Shared data model for the tunerd tuner arbiter.
//!
//! This crate defines the catalog types exchanged between the demultiplexer,
//! the EPG assembler, the tuner arbiter and any API layer built on top:
//!
//! - [`Channel`]: Physical tuning target
//! - [`Service`]: Broadcast service discovered inside a channel
//! - [`Program`]: EPG event of a service
//! - [`CatalogEvent`]: Change notification pushed by the catalog stores
//!
//! Ids are derived deterministically from broadcast identifiers:
//!
//! ```rust
//! use tunerd_model::{program_id, service_item_id};
//!
//! assert_eq!(service_item_id(0x7FE8, 1024), 3_273_601_024);
//! assert_eq!(program_id(1, 2, 3), 100_002 * 100_000 + 3);
//! ```

pub mod error;
pub mod types;

pub use error::{DecodeError, FilterError, TunerError};
pub use types::{
    program_id, service_item_id, AudioInfo, CatalogEvent, Channel, ChannelKey, ChannelType,
    EventKind, Genre, Polarity, Program, ProgramId, ProgramPatch, RelatedItem, RelatedItemType,
    SeriesInfo, Service, ServiceItemId, ServicePatch, Timestamp, TuningParams, VideoInfo,
};
