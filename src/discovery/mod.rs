//! Input discovery from directory naming conventions

pub mod scanner;

pub use scanner::{BatchUnit, Discovery, DirectoryScanner, FrameWindow, UnitKind, UnitPattern};
