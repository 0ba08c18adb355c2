//! Gitignore-style pattern matching.
//!
//! Patterns compile to anchored regexes under these rules:
//!
//! - `*` matches any sequence of non-`/` characters
//! - `?` matches one non-`/` character
//! - `**/` matches zero or more whole path components
//! - a trailing `/` requires a directory match
//! - a `/` anywhere else anchors the pattern at the directory it was
//!   declared in; without one the pattern matches at any depth
//! - a leading `/` or `./` anchors without adding a component
//! - a leading `!` re-includes a previously excluded path
//!
//! Evaluation is last-match-wins over the accumulated pattern list,
//! outermost `.gitignore` first, exactly like git.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;

use super::walk::FileMatcher;

/// One compiled pattern line.
#[derive(Debug, Clone)]
pub struct GlobPattern {
  source: String,
  negated: bool,
  dir_only: bool,
  regex: Regex,
  /// Per-component regexes for "could a match live under this directory"
  /// checks; only built for anchored multi-component patterns.
  components: Option<Vec<ComponentPattern>>,
}

#[derive(Debug, Clone)]
enum ComponentPattern {
  /// `**`: matches any number of components.
  AnyDepth,
  Single(Regex),
}

impl GlobPattern {
  /// Compile one pattern line. Returns `None` for blank lines and comments.
  pub fn parse(line: &str) -> Option<GlobPattern> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with('#') {
      return None;
    }

    let source = line.to_string();
    let (negated, mut pat) = match line.strip_prefix('!') {
      Some(rest) => (true, rest),
      None => (false, line),
    };

    let mut anchored = false;
    if let Some(rest) = pat.strip_prefix("./") {
      anchored = true;
      pat = rest;
    } else if let Some(rest) = pat.strip_prefix('/') {
      anchored = true;
      pat = rest;
    }

    let dir_only = pat.ends_with('/');
    let pat = pat.trim_end_matches('/');
    if pat.is_empty() {
      return None;
    }
    if pat.contains('/') {
      anchored = true;
    }

    let body = glob_to_regex(pat);
    let full = if anchored {
      format!("^{body}$")
    } else {
      format!("^(?:.*/)?{body}$")
    };
    let regex = match Regex::new(&full) {
      Ok(re) => re,
      Err(err) => {
        warn!(pattern = %source, error = %err, "skipping unparseable ignore pattern");
        return None;
      }
    };

    let components = if anchored && pat.contains('/') {
      Some(
        pat
          .split('/')
          .map(|comp| {
            if comp == "**" {
              ComponentPattern::AnyDepth
            } else {
              let re = Regex::new(&format!("^{}$", glob_to_regex(comp)))
                .expect("single component regex always compiles");
              ComponentPattern::Single(re)
            }
          })
          .collect(),
      )
    } else {
      None
    };

    Some(GlobPattern {
      source,
      negated,
      dir_only,
      regex,
      components,
    })
  }

  /// Compile a list of lines, dropping blanks, comments and bad patterns.
  pub fn parse_all<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<GlobPattern> {
    lines.into_iter().filter_map(GlobPattern::parse).collect()
  }

  pub fn negated(&self) -> bool {
    self.negated
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  /// Does this pattern match the given path (relative to the pattern's
  /// declaration directory, `/`-separated)?
  pub fn matches(&self, rel: &str, is_dir: bool) -> bool {
    if self.dir_only && !is_dir {
      return false;
    }
    self.regex.is_match(rel)
  }

  /// Could a matching file live somewhere beneath this directory? Used by
  /// include matchers to decide whether descending is worthwhile.
  pub fn may_match_below(&self, rel_dir: &str) -> bool {
    let Some(components) = &self.components else {
      // Unanchored patterns only admit directories they match themselves.
      return false;
    };
    let dirs: Vec<&str> = rel_dir.split('/').collect();
    for (i, dir) in dirs.iter().enumerate() {
      match components.get(i) {
        None => return false,
        Some(ComponentPattern::AnyDepth) => return true,
        Some(ComponentPattern::Single(re)) => {
          if !re.is_match(dir) {
            return false;
          }
        }
      }
    }
    // Directory components all matched and the pattern goes deeper.
    components.len() > dirs.len()
  }
}

fn glob_to_regex(pat: &str) -> String {
  let mut out = String::new();
  let mut chars = pat.chars().peekable();
  while let Some(ch) = chars.next() {
    if ch == '*' {
      // `**/` eats zero or more whole components; bare `**` the rest.
      if chars.peek() == Some(&'*') {
        chars.next();
        if chars.peek() == Some(&'/') {
          chars.next();
          out.push_str("(?:[^/]+/)*");
        } else {
          out.push_str(".*");
        }
      } else {
        out.push_str("[^/]*");
      }
      continue;
    }
    match ch {
      '?' => out.push_str("[^/]"),
      c if c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-' => out.push(c),
      c if c.is_ascii() => {
        out.push('\\');
        out.push(c);
      }
      // Non-ASCII literals match themselves.
      c => out.push(c),
    }
  }
  out
}

/// A fixed exclude list rooted at one directory, last-match-wins.
#[derive(Debug, Clone)]
pub struct PatternSet {
  patterns: Vec<GlobPattern>,
}

impl PatternSet {
  pub fn new(patterns: Vec<GlobPattern>) -> Self {
    Self { patterns }
  }

  pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
    Self::new(GlobPattern::parse_all(lines))
  }

  pub fn is_empty(&self) -> bool {
    self.patterns.is_empty()
  }

  /// Is `rel` excluded? Checks the path itself and every ancestor
  /// directory, so a pattern matching `build/` also excludes files under
  /// it when the set is applied to a flat path list.
  pub fn excludes(&self, rel: &str, is_dir: bool) -> bool {
    let mut verdict = false;
    for (prefix, prefix_is_dir) in ancestors_then_self(rel, is_dir) {
      for pattern in &self.patterns {
        if pattern.matches(prefix, prefix_is_dir) {
          verdict = !pattern.negated;
        }
      }
    }
    verdict
  }
}

/// Yields every proper ancestor directory of `rel`, outermost first,
/// followed by `rel` itself.
fn ancestors_then_self(rel: &str, is_dir: bool) -> impl Iterator<Item = (&str, bool)> {
  let mut prefixes = Vec::new();
  let mut idx = 0;
  for (i, ch) in rel.char_indices() {
    if ch == '/' {
      prefixes.push((&rel[..i], true));
    }
    idx = i + ch.len_utf8();
  }
  prefixes.push((&rel[..idx], is_dir));
  prefixes.into_iter()
}

/// Exclusion matcher over a fixed pattern list (walks prune excluded
/// directories, so no per-file ancestor checks are needed here).
#[derive(Debug)]
pub struct PatternSetMatcher {
  root: PathBuf,
  patterns: PatternSet,
}

impl PatternSetMatcher {
  pub fn new(root: impl Into<PathBuf>, patterns: PatternSet) -> Self {
    Self {
      root: root.into(),
      patterns,
    }
  }

  fn rel(&self, path: &Path) -> String {
    path
      .strip_prefix(&self.root)
      .unwrap_or(path)
      .to_string_lossy()
      .replace('\\', "/")
  }
}

impl FileMatcher for PatternSetMatcher {
  fn visit_directory(&mut self, path: &Path) -> bool {
    !self.patterns.excludes(&self.rel(path), true)
  }

  fn visit_file(&mut self, path: &Path) -> bool {
    !self.patterns.excludes(&self.rel(path), false)
  }
}

/// The gitignore-aware source matcher.
///
/// `.gitignore` files are loaded lazily as directories are visited, from
/// the walk root down towards the path being tested; patterns accumulate
/// outermost-first and each applies relative to the directory it was found
/// in. Extra root-level patterns (the `.nzm-*` bookkeeping exclusion, a
/// unit's declared non-sources) participate as if written in a root
/// `.gitignore`.
#[derive(Debug)]
pub struct GitignoreMatcher {
  root: PathBuf,
  extra: Vec<GlobPattern>,
  loaded: HashMap<PathBuf, Vec<GlobPattern>>,
}

impl GitignoreMatcher {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      extra: Vec::new(),
      loaded: HashMap::new(),
    }
  }

  /// Add patterns that behave as if found in a root-level `.gitignore`.
  pub fn with_extra_patterns<'a>(mut self, lines: impl IntoIterator<Item = &'a str>) -> Self {
    self.extra.extend(GlobPattern::parse_all(lines));
    self
  }

  fn patterns_in(&mut self, dir: &Path) -> &[GlobPattern] {
    if !self.loaded.contains_key(dir) {
      let patterns = match fs::read_to_string(dir.join(".gitignore")) {
        Ok(text) => GlobPattern::parse_all(text.lines()),
        Err(_) => Vec::new(),
      };
      self.loaded.insert(dir.to_path_buf(), patterns);
    }
    &self.loaded[dir]
  }

  fn is_ignored(&mut self, path: &Path, is_dir: bool) -> bool {
    let Ok(rel) = path.strip_prefix(&self.root) else {
      return false;
    };
    let rel_str = rel.to_string_lossy().replace('\\', "/");

    let mut verdict = false;

    // Root-level extra patterns first (outermost).
    for pattern in &self.extra {
      if pattern.matches(&rel_str, is_dir) {
        verdict = !pattern.negated();
      }
    }

    // Then each .gitignore from the root towards the file, each applied
    // to the path relative to its own directory.
    let mut dir = self.root.clone();
    let mut remaining = rel_str.as_str();
    loop {
      for pattern in self.patterns_in(&dir).to_vec() {
        if pattern.matches(remaining, is_dir) {
          verdict = !pattern.negated();
        }
      }
      match remaining.split_once('/') {
        Some((head, tail)) => {
          dir = dir.join(head);
          remaining = tail;
        }
        None => break,
      }
    }

    verdict
  }
}

impl FileMatcher for GitignoreMatcher {
  fn visit_directory(&mut self, path: &Path) -> bool {
    !self.is_ignored(path, true)
  }

  fn visit_file(&mut self, path: &Path) -> bool {
    !self.is_ignored(path, false)
  }
}

/// Inclusion matcher: admits only files matching at least one pattern.
///
/// Directories are descended when a pattern matches the directory itself
/// (`*/`, `**/*`) or when an anchored multi-component pattern could still
/// match deeper (`lib/**/*.d.ts` admits `lib/`).
#[derive(Debug)]
pub struct InclusionMatcher {
  root: PathBuf,
  patterns: Vec<GlobPattern>,
}

impl InclusionMatcher {
  pub fn new<'a>(root: impl Into<PathBuf>, lines: impl IntoIterator<Item = &'a str>) -> Self {
    Self {
      root: root.into(),
      patterns: GlobPattern::parse_all(lines),
    }
  }

  fn rel(&self, path: &Path) -> String {
    path
      .strip_prefix(&self.root)
      .unwrap_or(path)
      .to_string_lossy()
      .replace('\\', "/")
  }
}

impl FileMatcher for InclusionMatcher {
  fn visit_directory(&mut self, path: &Path) -> bool {
    let rel = self.rel(path);
    self
      .patterns
      .iter()
      .any(|p| p.matches(&rel, true) || p.may_match_below(&rel))
  }

  fn visit_file(&mut self, path: &Path) -> bool {
    let rel = self.rel(path);
    self.patterns.iter().any(|p| !p.dir_only && p.matches(&rel, false))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fileset::walk::walk_files;
  use tempfile::TempDir;

  fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "").unwrap();
  }

  /// The fixture tree used by all matcher cases.
  fn fixture() -> TempDir {
    let tmp = TempDir::new().unwrap();
    touch(&tmp.path().join("bloop.ts"));
    touch(&tmp.path().join("node_modules/inner"));
    touch(&tmp.path().join("subdir/bla.log"));
    touch(&tmp.path().join(".eslintrc.js"));
    tmp
  }

  fn names(paths: Vec<PathBuf>) -> Vec<String> {
    paths
      .into_iter()
      .map(|p| p.to_string_lossy().replace('\\', "/"))
      .collect()
  }

  #[test]
  fn directory_pattern_prunes_whole_tree() {
    let tmp = fixture();
    let mut matcher =
      PatternSetMatcher::new(tmp.path(), PatternSet::from_lines(["node_modules/"]));
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(files, vec![".eslintrc.js", "bloop.ts", "subdir/bla.log"]);
  }

  #[test]
  fn negation_reincludes_file() {
    let tmp = fixture();
    let mut matcher =
      PatternSetMatcher::new(tmp.path(), PatternSet::from_lines(["*.js", "!.eslintrc.js"]));
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(
      files,
      vec![".eslintrc.js", "bloop.ts", "node_modules/inner", "subdir/bla.log"]
    );
  }

  #[test]
  fn slash_pattern_anchors_at_root() {
    let tmp = fixture();
    let mut matcher =
      PatternSetMatcher::new(tmp.path(), PatternSet::from_lines(["subdir/bla.log"]));
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(files, vec![".eslintrc.js", "bloop.ts", "node_modules/inner"]);
  }

  #[test]
  fn include_dir_and_extension_patterns() {
    let tmp = fixture();
    let mut matcher = InclusionMatcher::new(tmp.path(), ["*/", "*.log"]);
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(files, vec!["subdir/bla.log"]);
  }

  #[test]
  fn include_double_star_matches_everything() {
    let tmp = fixture();
    let mut matcher = InclusionMatcher::new(tmp.path(), ["**/*"]);
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(
      files,
      vec![".eslintrc.js", "bloop.ts", "node_modules/inner", "subdir/bla.log"]
    );
  }

  #[test]
  fn include_anchored_pattern_descends_prefix_dirs() {
    let tmp = TempDir::new().unwrap();
    touch(&tmp.path().join("lib/sub/a.d.ts"));
    touch(&tmp.path().join("lib/sub/a.js"));
    touch(&tmp.path().join("src/b.d.ts"));

    let mut matcher = InclusionMatcher::new(tmp.path(), ["lib/**/*.d.ts"]);
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(files, vec!["lib/sub/a.d.ts"]);
  }

  #[test]
  fn gitignore_files_load_per_directory() {
    let tmp = fixture();
    fs::write(tmp.path().join(".gitignore"), "*.log\n").unwrap();
    fs::write(tmp.path().join("subdir/.gitignore"), "!bla.log\n").unwrap();

    let mut matcher = GitignoreMatcher::new(tmp.path());
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    // Root ignores logs, the inner .gitignore re-includes this one.
    assert!(files.contains(&"subdir/bla.log".to_string()));
  }

  #[test]
  fn inner_gitignore_applies_relative_to_its_directory() {
    let tmp = TempDir::new().unwrap();
    touch(&tmp.path().join("a/skip.txt"));
    touch(&tmp.path().join("b/skip.txt"));
    fs::write(tmp.path().join("a/.gitignore"), "skip.txt\n").unwrap();

    let mut matcher = GitignoreMatcher::new(tmp.path());
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert_eq!(files, vec!["a/.gitignore", "b/skip.txt"]);
  }

  #[test]
  fn extra_patterns_behave_like_root_gitignore() {
    let tmp = fixture();
    touch(&tmp.path().join(".nzm-buildcache"));

    let mut matcher = GitignoreMatcher::new(tmp.path()).with_extra_patterns([".nzm-*"]);
    let files = names(walk_files(tmp.path(), &mut matcher).unwrap());
    assert!(!files.iter().any(|f| f.starts_with(".nzm-")));
  }

  #[test]
  fn excludes_applies_to_paths_under_matched_directory() {
    let set = PatternSet::from_lines(["build/"]);
    assert!(set.excludes("build/out.js", false));
    assert!(set.excludes("build", true));
    assert!(!set.excludes("src/build.ts", false));
  }

  #[test]
  fn comments_and_blanks_are_skipped() {
    let patterns = GlobPattern::parse_all(["# comment", "", "*.log"]);
    assert_eq!(patterns.len(), 1);
  }
}
