//! LDX injection engine
//!
//! Places the latest form values into a data-logger configuration file:
//! [`selector`] picks the value each field contributes, [`namer`] decides the
//! tag it lands in, and [`merge`] applies both to the parsed [`tree`] and
//! writes the file back.

pub mod merge;
pub mod namer;
pub mod selector;
pub mod tree;

pub use merge::{existing_tags, MergeEngine, MergeOutcome, SkippedField};
pub use namer::{assign_tag_ids, ExistingTags, NameRequest, NOTES_FIELD};
pub use selector::{Destination, Selection, Selector, SkipReason};
pub use tree::{Document, Element, Node, ParseError};
