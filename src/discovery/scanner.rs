//! Directory scanner - snapshots a directory and returns matching units in order

use crate::core::error::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Naming convention for discoverable units
#[derive(Debug, Clone)]
pub enum UnitPattern {
    /// Regular files whose name ends with the suffix (e.g. `_master.h5`)
    Suffix(String),
    /// Regular files whose name matches the expression
    Regex(Regex),
    /// Subdirectories that contain the named partition directory; the unit is
    /// `<root>/<id>/<partition>` (e.g. `refined/ref_run1/batch_1`)
    Partition(String),
}

impl UnitPattern {
    /// Identity of the unit derived from its entry name
    fn unit_id(&self, name: &str) -> String {
        match self {
            UnitPattern::Suffix(suffix) => name.strip_suffix(suffix.as_str()).unwrap_or(name).to_string(),
            UnitPattern::Regex(_) => Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string()),
            UnitPattern::Partition(_) => name.to_string(),
        }
    }

    fn matches_file(&self, name: &str) -> bool {
        match self {
            UnitPattern::Suffix(suffix) => name.len() > suffix.len() && name.ends_with(suffix.as_str()),
            UnitPattern::Regex(regex) => regex.is_match(name),
            UnitPattern::Partition(_) => false,
        }
    }
}

impl fmt::Display for UnitPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitPattern::Suffix(suffix) => write!(f, "*{}", suffix),
            UnitPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            UnitPattern::Partition(name) => write!(f, "*/{}/", name),
        }
    }
}

/// An inclusive range of frame numbers written as a zero-padded field right
/// after a name prefix. `chip1_7_00003.cbf` is frame 3 for prefix `chip1_7_`
/// and width 5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameWindow {
    pub prefix: String,
    pub width: usize,
    pub first: u64,
    pub last: u64,
}

impl FrameWindow {
    /// The `size` frames that end at `last`, clipped at frame 0
    pub fn ending_at(prefix: impl Into<String>, width: usize, last: u64, size: u64) -> Self {
        Self {
            prefix: prefix.into(),
            width,
            first: (last + 1).saturating_sub(size),
            last,
        }
    }

    /// Frame number encoded in `name`, if it follows the prefix
    pub fn frame(&self, name: &str) -> Option<u64> {
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let digits = rest.get(..self.width)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if rest[self.width..].starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.frame(name)
            .is_some_and(|frame| (self.first..=self.last).contains(&frame))
    }
}

impl fmt::Display for FrameWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{prefix}{{{first:0w$}..{last:0w$}}}",
            prefix = self.prefix,
            first = self.first,
            last = self.last,
            w = self.width
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    File,
    Partition,
}

/// One discovered piece of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnit {
    pub path: PathBuf,
    /// Identity used to derive per-unit output paths (e.g. `run1` for `run1_master.h5`)
    pub id: String,
    pub kind: UnitKind,
}

impl BatchUnit {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A sorted snapshot of the units found under a root. Iterating it again
/// yields the same sequence.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub root: PathBuf,
    pub pattern: String,
    units: Vec<BatchUnit>,
}

impl Discovery {
    pub fn units(&self) -> &[BatchUnit] {
        &self.units
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BatchUnit> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Keep only the first `n` units
    pub fn limit(mut self, n: usize) -> Self {
        self.units.truncate(n);
        self
    }

    /// Keep only units whose file name falls inside `window`
    pub fn window(mut self, window: &FrameWindow) -> Self {
        self.units.retain(|unit| window.contains(&unit.file_name()));
        self.pattern = format!("{} in {}", self.pattern, window);
        self
    }

    /// Fail if two units would share an id, and with it any path derived from it
    pub fn ensure_unique_ids(&self) -> Result<(), PipelineError> {
        let mut seen: BTreeMap<&str, &Path> = BTreeMap::new();
        for unit in &self.units {
            if let Some(other) = seen.insert(unit.id.as_str(), unit.path.as_path()) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "units {} and {} both have id '{}'; narrow the unit pattern",
                    other.display(),
                    unit.path.display(),
                    unit.id
                )));
            }
        }
        Ok(())
    }

    pub fn into_units(self) -> Vec<BatchUnit> {
        self.units
    }
}

impl<'a> IntoIterator for &'a Discovery {
    type Item = &'a BatchUnit;
    type IntoIter = std::slice::Iter<'a, BatchUnit>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

/// Scans a directory for units matching a pattern
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    pattern: UnitPattern,
}

impl DirectoryScanner {
    pub fn new(pattern: UnitPattern) -> Self {
        Self { pattern }
    }

    pub fn pattern(&self) -> &UnitPattern {
        &self.pattern
    }

    /// Snapshot `root` and return matching units sorted by path.
    ///
    /// A missing root yields an empty discovery. Dot-files are skipped since
    /// they are in-flight temporaries of atomic writers.
    pub fn scan(&self, root: &Path) -> Result<Discovery, PipelineError> {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Discovery root {} does not exist", root.display());
                return Ok(self.discovery(root, Vec::new()));
            }
            Err(e) => return Err(PipelineError::io(root, e)),
        };

        let mut units = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();

            match &self.pattern {
                UnitPattern::Partition(partition) => {
                    let nested = path.join(partition);
                    if path.is_dir() && nested.is_dir() {
                        units.push(BatchUnit {
                            path: nested,
                            id: self.pattern.unit_id(&name),
                            kind: UnitKind::Partition,
                        });
                    }
                }
                pattern => {
                    if pattern.matches_file(&name) && path.is_file() {
                        units.push(BatchUnit {
                            path,
                            id: pattern.unit_id(&name),
                            kind: UnitKind::File,
                        });
                    }
                }
            }
        }

        units.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Discovered {} unit(s) matching {} under {}",
            units.len(),
            self.pattern,
            root.display()
        );
        Ok(self.discovery(root, units))
    }

    /// Like [`scan`](Self::scan), but an empty result is an error when `mandatory`
    pub fn discover(&self, root: &Path, mandatory: bool) -> Result<Discovery, PipelineError> {
        let discovery = self.scan(root)?;
        if mandatory && discovery.is_empty() {
            return Err(PipelineError::EmptyDiscoverySet {
                root: root.to_path_buf(),
                pattern: self.pattern.to_string(),
            });
        }
        Ok(discovery)
    }

    fn discovery(&self, root: &Path, units: Vec<BatchUnit>) -> Discovery {
        Discovery {
            root: root.to_path_buf(),
            pattern: self.pattern.to_string(),
            units,
        }
    }
}
