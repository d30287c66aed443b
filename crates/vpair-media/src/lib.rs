//! External media tool wrappers.
//!
//! This crate provides:
//! - Type-safe command building for the sample, metadata and alignment tools
//! - A runner that streams the tools' line protocol back as typed messages
//! - Metadata extraction with an ffprobe fallback
//! - The `MediaToolkit` trait consumed by job runners

pub mod align;
pub mod command;
pub mod error;
pub mod probe;
pub mod progress;
pub mod sample;
pub mod toolkit;

pub use command::{collect_tail, decode_stream, join_reader, ToolCommand, ToolOutput, ToolRunner, OUTPUT_GRACE};
pub use error::{MediaError, MediaResult};
pub use probe::extract_metadata;
pub use progress::{decode_line, encode, TaggedMessage, ToolMessage, PROTOCOL_VERSION};
pub use sample::SampleVideoSpec;
pub use toolkit::{ExternalToolkit, MediaToolkit, ProgressFn, ToolkitConfig};
