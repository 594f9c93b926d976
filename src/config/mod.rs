//! L1: Config Provider — typed section/option lookups from a text file.
//!
//! The file format is INI-style: `[section]` headers followed by
//! `key = value` lines. Parsing is hand-rolled the same way
//! `units::unit_parsing::parse_file` reads systemd-style unit files in
//! the sibling project this launcher is modeled on: no `toml`/`config`
//! crate, because the section-family fallback rules of §6 (sub-section
//! -> family section -> `[brim]`) don't map onto a generic format
//! loader anyway.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;

pub type ParsedSection = HashMap<String, String>;
pub type ParsedFile = HashMap<String, ParsedSection>;

/// Parse INI-style text into a section -> (key -> value) map.
///
/// Lines before the first `[section]` header are ignored. `;` and `#`
/// start a comment that runs to the end of the line. A section appearing
/// twice is a `ConfigError::SectionTooOften`.
pub fn parse_file(content: &str) -> Result<ParsedFile, ConfigError> {
    let mut sections: ParsedFile = HashMap::new();
    let mut current: Option<String> = None;

    for raw_line in content.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = parse_section_header(line) {
            if sections.contains_key(&name) {
                return Err(ConfigError::SectionTooOften(name));
            }
            sections.insert(name.clone(), ParsedSection::new());
            current = Some(name);
            continue;
        }
        let Some(section_name) = &current else {
            // Stray option before any section header; ignore like rustysd
            // ignores stray lines before the first section.
            continue;
        };
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim().to_lowercase();
            let value = value.trim().to_string();
            sections
                .get_mut(section_name)
                .expect("section was just inserted")
                .insert(key, value);
        }
    }

    Ok(sections)
}

fn strip_comment(line: &str) -> &str {
    for (idx, c) in line.char_indices() {
        if c == ';' || c == '#' {
            return &line[..idx];
        }
    }
    line
}

fn parse_section_header(line: &str) -> Option<String> {
    let line = line.strip_prefix('[')?;
    let line = line.strip_suffix(']')?;
    Some(line.trim().to_string())
}

/// Splits a section name like `wsgi#alt` into its family (`wsgi`) and
/// optional suffix (`alt`).
#[must_use]
pub fn split_family(section: &str) -> (&str, Option<&str>) {
    match section.split_once('#') {
        Some((family, suffix)) => (family, Some(suffix)),
        None => (section, None),
    }
}

/// Typed, scope-aware lookups over a `ParsedFile`.
///
/// Option lookup for a sub-section falls back to the top-level family
/// section, then to `[brim]`, per §6.
pub struct ConfigProvider {
    file: ParsedFile,
}

impl ConfigProvider {
    #[must_use]
    pub fn new(file: ParsedFile) -> Self {
        Self { file }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Ok(Self::new(parse_file(&content)?))
    }

    /// Applies `-o section.key=value` command-line overrides on top of
    /// whatever the config file already set (§10.4).
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ConfigError> {
        for raw in overrides {
            let (path, value) = raw.split_once('=').ok_or_else(|| ConfigError::BadValue {
                section: String::new(),
                key: String::new(),
                value: raw.clone(),
            })?;
            let (section, key) = path.split_once('.').ok_or_else(|| ConfigError::BadValue {
                section: String::new(),
                key: String::new(),
                value: raw.clone(),
            })?;
            self.file
                .entry(section.to_string())
                .or_default()
                .insert(key.to_lowercase(), value.to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn section_names(&self) -> Vec<&str> {
        self.file.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn sections_in_family<'a>(&'a self, family: &str) -> Vec<&'a str> {
        let mut names: Vec<&str> = self
            .file
            .keys()
            .filter(|name| split_family(name).0 == family)
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    /// Look up `key` in `section`, falling back to the section's family
    /// (if `section` has a `#suffix`) and then to `[brim]`.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        if let Some(v) = self.file.get(section).and_then(|s| s.get(key)) {
            return Some(v);
        }
        let (family, suffix) = split_family(section);
        if suffix.is_some() {
            if let Some(v) = self.file.get(family).and_then(|s| s.get(key)) {
                return Some(v);
            }
        }
        if section != "brim" && family != "brim" {
            if let Some(v) = self.file.get("brim").and_then(|s| s.get(key)) {
                return Some(v);
            }
        }
        None
    }

    pub fn get_required<'a>(&'a self, section: &str, key: &str) -> Result<&'a str, ConfigError> {
        self.get(section, key)
            .ok_or_else(|| ConfigError::MissingRequired {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    #[must_use]
    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    pub fn get_u16(&self, section: &str, key: &str, default: u16) -> Result<u16, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::BadValue {
                section: section.to_string(),
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    pub fn get_u32(&self, section: &str, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| ConfigError::BadValue {
                section: section.to_string(),
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            None => default,
            Some(v) => string_to_bool(v),
        }
    }

    /// Space-separated list, honoring shell-style quoting (the same
    /// `shlex` based parsing rustysd uses for `Environment=` lines).
    #[must_use]
    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        match self.get(section, key) {
            None => Vec::new(),
            Some(v) => shlex::split(v).unwrap_or_default(),
        }
    }
}

#[must_use]
pub fn string_to_bool(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let upper = s.to_uppercase();
    upper == "YES" || upper == "TRUE" || upper == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_suffixes() {
        let content = "\
[brim]
user = www
log_level = info

[wsgi]
port = 8901
apps = echo

[wsgi#alt]
port = 8902
";
        let parsed = parse_file(content).unwrap();
        assert_eq!(parsed.len(), 3);
        let cfg = ConfigProvider::new(parsed);
        assert_eq!(cfg.get("wsgi", "port"), Some("8901"));
        assert_eq!(cfg.get("wsgi#alt", "port"), Some("8902"));
        // falls back to the family section
        assert_eq!(cfg.get("wsgi#alt", "apps"), Some("echo"));
        // falls back to [brim]
        assert_eq!(cfg.get("wsgi#alt", "user"), Some("www"));
    }

    #[test]
    fn duplicate_section_is_an_error() {
        let content = "[wsgi]\nport=1\n[wsgi]\nport=2\n";
        assert!(matches!(
            parse_file(content),
            Err(ConfigError::SectionTooOften(_))
        ));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let content = "; leading comment\n[brim]\n# another comment\nuser = root\n\n";
        let parsed = parse_file(content).unwrap();
        let cfg = ConfigProvider::new(parsed);
        assert_eq!(cfg.get("brim", "user"), Some("root"));
    }

    #[test]
    fn apply_overrides_sets_and_adds_sections() {
        let mut cfg = ConfigProvider::new(parse_file("[wsgi]\nport = 8901\n").unwrap());
        cfg.apply_overrides(&["wsgi.port=9000".to_string(), "brim.user=www".to_string()])
            .unwrap();
        assert_eq!(cfg.get("wsgi", "port"), Some("9000"));
        assert_eq!(cfg.get("brim", "user"), Some("www"));
    }

    #[test]
    fn string_to_bool_accepts_common_spellings() {
        assert!(string_to_bool("yes"));
        assert!(string_to_bool("TRUE"));
        assert!(string_to_bool("1"));
        assert!(!string_to_bool("no"));
        assert!(!string_to_bool(""));
    }

    #[test]
    fn from_path_reads_a_real_file_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[brim]\npid_file = /tmp/brimd.pid\n").unwrap();
        let cfg = ConfigProvider::from_path(file.path()).unwrap();
        assert_eq!(cfg.get("brim", "pid_file"), Some("/tmp/brimd.pid"));
    }

    #[test]
    fn from_path_reports_io_error_for_missing_file() {
        let path = std::env::temp_dir().join("brimd-does-not-exist.conf");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            ConfigProvider::from_path(&path),
            Err(ConfigError::Io(_))
        ));
    }
}
