//! Namespace search over a newline-delimited metric index file.

use crate::error::QueryError;
use crate::pattern::{is_pattern, GlobPattern};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Instant, SystemTime};

/// One search hit. Branch paths end with `.`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub is_leaf: bool,
}

#[derive(Debug, Default)]
struct IndexNode {
    leaf: bool,
    children: BTreeMap<String, IndexNode>,
}

impl IndexNode {
    fn insert(&mut self, path: &str) {
        let mut cursor = self;
        for segment in path.split('.') {
            cursor = cursor.children.entry(segment.to_string()).or_default();
        }
        cursor.leaf = true;
    }
}

#[derive(Debug, Default)]
struct IndexState {
    root: IndexNode,
    entries: usize,
    loaded_mtime: Option<SystemTime>,
}

/// Tree of every metric path listed in an index file.
///
/// The file is re-read whenever its modification time moves past the last
/// load, so searches see new metrics without a restart.
#[derive(Debug)]
pub struct IndexSearcher {
    path: PathBuf,
    state: RwLock<IndexState>,
}

fn io_error(path: &Path, action: &str, e: std::io::Error) -> QueryError {
    QueryError::ConfigError(format!("cannot {} index {}: {}", action, path.display(), e))
}

impl IndexSearcher {
    /// Opens the index at `path`, creating an empty file if it does not exist.
    ///
    /// # Errors
    /// Returns `ConfigError` when the file cannot be created or read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueryError> {
        let searcher = IndexSearcher {
            path: path.into(),
            state: RwLock::new(IndexState::default()),
        };
        searcher.reload()?;
        Ok(searcher)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of leaf entries loaded.
    pub fn len(&self) -> Result<usize, QueryError> {
        Ok(self.state.read()?.entries)
    }

    pub fn is_empty(&self) -> Result<bool, QueryError> {
        Ok(self.len()? == 0)
    }

    fn mtime(&self) -> Result<SystemTime, QueryError> {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| io_error(&self.path, "stat", e))
    }

    /// Re-reads the index file; returns the number of entries loaded.
    pub fn reload(&self) -> Result<usize, QueryError> {
        let started = Instant::now();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, "open", e))?;
        let mtime = self.mtime()?;

        let mut root = IndexNode::default();
        let mut entries = 0;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_error(&self.path, "read", e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            root.insert(line);
            entries += 1;
        }

        *self.state.write()? = IndexState {
            root,
            entries,
            loaded_mtime: Some(mtime),
        };
        tracing::debug!(
            index = %self.path.display(),
            entries,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search index reloaded"
        );
        Ok(entries)
    }

    fn reload_if_stale(&self) -> Result<(), QueryError> {
        let current = self.mtime()?;
        let stale = self.state.read()?.loaded_mtime.map_or(true, |loaded| current > loaded);
        if stale {
            self.reload()?;
        }
        Ok(())
    }

    /// Walks the tree along `query`'s dot-separated segments.
    ///
    /// Every node matched at each level is returned, followed (once the query
    /// is exhausted) by the children of the last matched level. Results are
    /// unique and capped at `max_results`.
    ///
    /// # Errors
    /// Returns `InvalidPattern` for a malformed segment, or `ConfigError` if
    /// the index file became unreadable.
    pub fn search(&self, query: &str, max_results: Option<usize>) -> Result<Vec<SearchResult>, QueryError> {
        self.reload_if_stale()?;
        let parts = query
            .split('.')
            .map(|part| {
                if is_pattern(part) {
                    GlobPattern::compile(part).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let literals: Vec<&str> = query.split('.').collect();

        let state = self.state.read()?;
        let mut walk = Walk {
            parts: &parts,
            literals: &literals,
            max_results,
            seen: HashSet::new(),
            out: Vec::new(),
        };
        walk.visit(&state.root, "", 0);
        Ok(walk.out)
    }
}

struct Walk<'q> {
    parts: &'q [Option<GlobPattern>],
    literals: &'q [&'q str],
    max_results: Option<usize>,
    seen: HashSet<String>,
    out: Vec<SearchResult>,
}

impl Walk<'_> {
    fn full(&self) -> bool {
        self.max_results.is_some_and(|max| self.out.len() >= max)
    }

    fn visit(&mut self, node: &IndexNode, prefix: &str, depth: usize) {
        let matches: Vec<(&String, &IndexNode)> = match self.parts.get(depth) {
            None => node.children.iter().collect(),
            Some(Some(pattern)) => node
                .children
                .iter()
                .filter(|(name, _)| pattern.matches_segment(0, name))
                .collect(),
            Some(None) => node
                .children
                .get_key_value(self.literals[depth])
                .into_iter()
                .collect(),
        };

        for (name, child) in matches {
            if self.full() {
                return;
            }
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            let shown = if child.leaf { path.clone() } else { format!("{}.", path) };
            if self.seen.insert(shown.clone()) {
                self.out.push(SearchResult {
                    path: shown,
                    is_leaf: child.leaf,
                });
            }
            if depth < self.parts.len() {
                self.visit(child, &path, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn searcher(lines: &str) -> (tempfile::TempDir, IndexSearcher) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        fs::write(&path, lines).unwrap();
        let searcher = IndexSearcher::open(&path).unwrap();
        (dir, searcher)
    }

    fn paths(results: Vec<SearchResult>) -> Vec<String> {
        results.into_iter().map(|r| r.path).collect()
    }

    #[test]
    fn missing_index_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new-index");
        let searcher = IndexSearcher::open(&path).unwrap();
        assert!(path.exists());
        assert!(searcher.is_empty().unwrap());
        assert!(searcher.search("*", None).unwrap().is_empty());
    }

    #[test]
    fn glob_segments_walk_the_tree() {
        let (_dir, searcher) = searcher("servers.web1.cpu\nservers.web2.cpu\nservers.db1.mem\n\nother.x\n");
        assert_eq!(searcher.len().unwrap(), 4);
        assert_eq!(
            paths(searcher.search("servers.web*", None).unwrap()),
            vec!["servers.", "servers.web1.", "servers.web1.cpu", "servers.web2.", "servers.web2.cpu"]
        );
        let leaves: Vec<_> = searcher
            .search("servers.*.cpu", None)
            .unwrap()
            .into_iter()
            .filter(|r| r.is_leaf)
            .map(|r| r.path)
            .collect();
        assert_eq!(leaves, vec!["servers.web1.cpu", "servers.web2.cpu"]);
    }

    #[test]
    fn max_results_caps_output() {
        let (_dir, searcher) = searcher("a.x\na.y\na.z\n");
        assert_eq!(searcher.search("a.*", Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn invalid_segment_is_rejected() {
        let (_dir, searcher) = searcher("a.b\n");
        assert!(matches!(
            searcher.search("a.[b", None),
            Err(QueryError::InvalidPattern { .. })
        ));
    }
}
