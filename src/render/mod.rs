//! Config rendering: templates, config text parsing, atomic file placement

pub mod phil;
pub mod template;
pub mod writer;

pub use template::{ConfigTemplate, TemplateSet};
pub use writer::{write_atomic, write_new_atomic};
