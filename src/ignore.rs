use std::{fs, io, path::Path};

use regex::Regex;
use tracing::debug;

use crate::error::Result;

pub const IGNORE_FILE: &str = ".fsignore";

/// Patterns anchored at the start of a root-relative path.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Regex>,
}

impl IgnoreRules {
    /// Reads `.fsignore` from `root`. A missing file yields no rules.
    pub fn load(root: &Path) -> Result<Self> {
        match fs::read_to_string(root.join(IGNORE_FILE)) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                debug!(pattern = line, "ignore rule");
                Regex::new(&format!("^(?:{line})"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The first rule matching `relative`, if any.
    pub fn matching(&self, relative: &str) -> Option<&Regex> {
        self.patterns.iter().find(|p| p.is_match(relative))
    }
}
