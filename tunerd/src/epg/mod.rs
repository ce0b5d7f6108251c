//! EPG assembly from versioned EIT / MH-EIT sections.
//!
//! [`EpgAssembler`] creates and fills catalog programs per event with a
//! per-field version gate, evicts overlapping programs, and marks services
//! `epgReady` once their schedule tables have been fully observed.

mod assembler;
mod completeness;
mod state;

pub use assembler::{merge_extended, EpgAssembler};
pub use completeness::ServiceCompleteness;
pub use state::{ExtendedBuffer, FieldKind, TableClass, TableVersion, VersionGate};
