//! Glob patterns for matching host paths such as device nodes.
//!
//! Isolation levels describe the devices they block as globs (`/dev/sd*`,
//! `/dev/nvidia*`, `/dev/dri/**`). Patterns are compiled to anchored regexes
//! once and then matched against absolute paths.
//!
//! Supported syntax:
//! - `*` matches within a single path component
//! - `**` matches across components
//! - `?` matches one character other than `/`
//! - `[...]` character classes are passed through
//!
//! ```
//! use isolator::utils::glob::PathPatterns;
//!
//! let blocked = PathPatterns::new(["/dev/sd*", "/dev/nvme*"]).unwrap();
//! assert!(blocked.matches("/dev/sda1"));
//! assert!(!blocked.matches("/dev/snd"));
//! ```

use std::path::Path;

use regex::Regex;

use crate::error::{IsolatorError, Result};

/// Compiles a single glob pattern into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let source = glob_to_regex_string(glob)?;
    Regex::new(&source)
        .map_err(|e| IsolatorError::Config(format!("invalid glob pattern '{glob}': {e}")))
}

fn glob_to_regex_string(glob: &str) -> Result<String> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '*' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                let Some(len) = glob[idx..].find(']') else {
                    return Err(IsolatorError::Config(format!(
                        "unclosed '[' at position {idx} in glob pattern '{glob}'"
                    )));
                };
                out.push_str(&glob[idx..=idx + len]);
                // Skip the rest of the class, the opening bracket is already consumed.
                while let Some((next, _)) = chars.peek() {
                    if *next > idx + len {
                        break;
                    }
                    chars.next();
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }

    out.push('$');
    Ok(out)
}

/// A compiled list of glob patterns matched against absolute paths.
#[derive(Debug, Clone)]
pub struct PathPatterns {
    patterns: Vec<(String, Regex)>,
}

impl PathPatterns {
    /// Compiles every pattern, failing on the first invalid one.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                glob_to_regex(p).map(|re| (p.to_string(), re))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Returns `true` if any pattern matches `path`.
    pub fn matches(&self, path: impl AsRef<Path>) -> bool {
        self.matching(path).is_some()
    }

    /// Returns the first pattern matching `path`.
    pub fn matching(&self, path: impl AsRef<Path>) -> Option<&str> {
        let path = path.as_ref().to_string_lossy();
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(&path))
            .map(|(source, _)| source.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_device() -> Result<()> {
        let re = glob_to_regex("/dev/mem")?;
        assert!(re.is_match("/dev/mem"));
        assert!(!re.is_match("/dev/memory"));
        assert!(!re.is_match("/dev/kmem"));
        Ok(())
    }

    #[test]
    fn test_single_asterisk_stays_in_component() -> Result<()> {
        let re = glob_to_regex("/dev/sd*")?;
        assert!(re.is_match("/dev/sda"));
        assert!(re.is_match("/dev/sdb2"));
        assert!(!re.is_match("/dev/sd/nested"));
        assert!(!re.is_match("/dev/snd"));
        Ok(())
    }

    #[test]
    fn test_double_asterisk_crosses_components() -> Result<()> {
        let re = glob_to_regex("/dev/dri/**")?;
        assert!(re.is_match("/dev/dri/card0"));
        assert!(re.is_match("/dev/dri/by-path/pci-0000"));
        assert!(!re.is_match("/dev/dri"));
        Ok(())
    }

    #[test]
    fn test_question_mark_and_class() -> Result<()> {
        let re = glob_to_regex("/dev/vd?")?;
        assert!(re.is_match("/dev/vda"));
        assert!(!re.is_match("/dev/vda1"));

        let re = glob_to_regex("/dev/loop[0-9]*")?;
        assert!(re.is_match("/dev/loop0"));
        assert!(re.is_match("/dev/loop12"));
        assert!(!re.is_match("/dev/loop-control"));
        Ok(())
    }

    #[test]
    fn test_regex_metacharacters_are_escaped() -> Result<()> {
        let re = glob_to_regex("/dev/nvidia.ctl")?;
        assert!(re.is_match("/dev/nvidia.ctl"));
        assert!(!re.is_match("/dev/nvidiaXctl"));
        Ok(())
    }

    #[test]
    fn test_unclosed_class_is_rejected() {
        assert!(glob_to_regex("/dev/sd[ab").is_err());
    }

    #[test]
    fn test_path_patterns_report_matching_source() -> Result<()> {
        let patterns = PathPatterns::new(["/dev/fb*", "/dev/dri", "/dev/dri/**"])?;
        assert_eq!(patterns.matching("/dev/fb0"), Some("/dev/fb*"));
        assert_eq!(patterns.matching("/dev/dri/card1"), Some("/dev/dri/**"));
        assert_eq!(patterns.matching("/dev/snd/pcmC0D0p"), None);
        assert!(!patterns.is_empty());
        Ok(())
    }
}
