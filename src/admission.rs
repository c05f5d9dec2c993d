//! Admission filter.
//!
//! A lexical pre-check run before any interpreter or capability is built.
//! Scripts that mention a denylisted identifier as a whole word are rejected
//! with the identifier named in the response.
//!
//! This is NOT a sandbox. It defeats literal use of an identifier, but not
//! aliasing, attribute traversal, string-built names, or other obfuscated
//! access to the same capability. The actual boundary is the script
//! environment assembled by [`crate::capability`], which never binds these
//! names in the first place; the filter only turns obvious attempts into a
//! fast, explicit 400 instead of a runtime fault.

use regex::Regex;
use thiserror::Error;

/// Identifiers rejected by default: process/OS access, subprocess spawn,
/// dynamic import, raw file open and dynamic evaluation, in both the legacy
/// keyword list and their Lua spellings.
pub const DEFAULT_DENIED: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "open",
    "popen",
    "eval",
    "exec",
    "importlib",
    "io",
    "require",
    "package",
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "debug",
    "collectgarbage",
    "getmetatable",
    "setmetatable",
    "rawget",
    "rawset",
    "rawequal",
    "_G",
];

/// A script refused before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("restricted identifier '{identifier}' is not allowed")]
pub struct Rejection {
    pub identifier: String,
    /// Byte offset of the match in the submitted script.
    pub offset: usize,
}

/// Whole-word denylist matcher.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    pattern: Regex,
    denied: Vec<String>,
}

impl AdmissionFilter {
    /// Filter with the default denylist plus `extra` identifiers.
    pub fn new<I, S>(extra: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut denied: Vec<String> = DEFAULT_DENIED.iter().map(|s| s.to_string()).collect();
        for ident in extra {
            let ident = ident.as_ref().trim();
            if !ident.is_empty() && !denied.iter().any(|d| d == ident) {
                denied.push(ident.to_string());
            }
        }
        let alternation = denied
            .iter()
            .map(|ident| regex::escape(ident))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"\b(?:{alternation})\b"))?;
        Ok(Self { pattern, denied })
    }

    /// Filter with only the default denylist.
    pub fn standard() -> Result<Self, regex::Error> {
        Self::new(std::iter::empty::<&str>())
    }

    pub fn denied(&self) -> &[String] {
        &self.denied
    }

    /// Reject the script if any denylisted identifier occurs as a whole word.
    /// The leftmost occurrence is reported.
    pub fn check(&self, script: &str) -> Result<(), Rejection> {
        match self.pattern.find(script) {
            Some(m) => Err(Rejection {
                identifier: m.as_str().to_string(),
                offset: m.start(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_import_os_naming_os() {
        let filter = AdmissionFilter::standard().unwrap();
        let rejection = filter.check("import os\noutput = 1").unwrap_err();
        assert_eq!(rejection.identifier, "os");
        assert_eq!(rejection.offset, 7);
    }

    #[test]
    fn matches_whole_words_only() {
        let filter = AdmissionFilter::standard().unwrap();
        assert!(filter.check("local osmosis = 1\noutput = osmosis").is_ok());
        assert!(filter.check("output = reopened or loader or evaluate").is_ok());
        assert!(filter.check("output = io_total").is_ok());
        assert!(filter.check("output = os.time()").is_err());
    }

    #[test]
    fn reports_leftmost_identifier() {
        let filter = AdmissionFilter::standard().unwrap();
        let rejection = filter.check("x = require('a')\ny = load('b')").unwrap_err();
        assert_eq!(rejection.identifier, "require");
    }

    #[test]
    fn longer_identifier_wins_over_prefix() {
        let filter = AdmissionFilter::standard().unwrap();
        let rejection = filter.check("f = loadstring").unwrap_err();
        assert_eq!(rejection.identifier, "loadstring");
    }

    #[test]
    fn extra_identifiers_extend_defaults() {
        let filter = AdmissionFilter::new(["socket", " ", "os"]).unwrap();
        assert_eq!(filter.check("socket.connect()").unwrap_err().identifier, "socket");
        assert_eq!(filter.check("os.exit()").unwrap_err().identifier, "os");
        assert_eq!(
            filter.denied().iter().filter(|d| d.as_str() == "os").count(),
            1
        );
    }

    #[test]
    fn underscore_globals_are_matched() {
        let filter = AdmissionFilter::standard().unwrap();
        assert_eq!(filter.check("output = _G").unwrap_err().identifier, "_G");
    }
}
