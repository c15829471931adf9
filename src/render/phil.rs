//! Reader for the `key = value` / `name { ... }` config text handed to the tools

use crate::core::error::PipelineError;

/// One assignment, with its enclosing block names joined by dots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhilEntry {
    pub path: String,
    pub value: String,
    pub line: usize,
}

/// Parse config text into its assignments, in file order.
///
/// Values are kept verbatim (trimmed), so numbers round-trip exactly as written.
pub fn parse(text: &str) -> Result<Vec<PhilEntry>, PipelineError> {
    let mut entries = Vec::new();
    let mut scopes: Vec<String> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        if line == "}" {
            if scopes.pop().is_none() {
                return Err(syntax(line_no, "unmatched '}'"));
            }
            continue;
        }

        if let Some(name) = line.strip_suffix('{') {
            let name = name.trim();
            if name.is_empty() || name.contains('=') {
                return Err(syntax(line_no, "block opened without a name"));
            }
            scopes.push(name.to_string());
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(syntax(line_no, &format!("expected 'key = value', got '{}'", line)));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(syntax(line_no, "assignment without a key"));
        }

        let path = if scopes.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", scopes.join("."), key)
        };
        entries.push(PhilEntry {
            path,
            value: value.trim().to_string(),
            line: line_no,
        });
    }

    if let Some(open) = scopes.last() {
        return Err(syntax(text.lines().count(), &format!("block '{}' is never closed", open)));
    }

    Ok(entries)
}

/// Value of the first assignment at `path`
pub fn lookup<'a>(entries: &'a [PhilEntry], path: &str) -> Option<&'a str> {
    entries.iter().find(|e| e.path == path).map(|e| e.value.as_str())
}

/// Every value assigned at `path` (repeated keys such as `input.directory`)
pub fn lookup_all<'a>(entries: &'a [PhilEntry], path: &str) -> Vec<&'a str> {
    entries
        .iter()
        .filter(|e| e.path == path)
        .map(|e| e.value.as_str())
        .collect()
}

fn syntax(line: usize, message: &str) -> PipelineError {
    PipelineError::ConfigSyntax {
        line,
        message: message.to_string(),
    }
}
