//! Pure, I/O-free building blocks of the grntest harness.
//!
//! Everything here operates on text and bytes already in memory: the
//! command grammar, directive tokenizing, log parsing and classification,
//! response decoding, template expansion and transcript normalization.

pub mod benchmark;
pub mod command;
pub mod diff;
pub mod directive;
pub mod error;
pub mod log;
pub mod log_filter;
pub mod normalize;
pub mod query_log;
pub mod response;
pub mod substitution;
pub mod template;
pub mod transcript;
pub mod types;

pub use command::{Argument, Command};
pub use directive::Directive;
pub use error::{CommandParseError, CoreError, DirectiveError, ResponseParseError};
pub use types::{InputType, Interface, OnError, OutputType};
