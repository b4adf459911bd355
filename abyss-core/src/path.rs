//! Path resolver: routes slash-delimited world paths to local world ids by longest prefix.
//!
//! One resolver may be shared by several hosts, so it synchronizes internally.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::world::WorldId;

/// Canonical form of a world path: leading `/`, no empty segments, no trailing `/`.
/// `"rooms//1/"` becomes `"/rooms/1"`; the empty string becomes `"/"`.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[derive(Default)]
pub struct PathResolver {
    mappings: RwLock<HashMap<String, WorldId>>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path` to a freshly generated world id, replacing any previous mapping.
    pub fn set_mapping(&self, path: &str) -> WorldId {
        let id = WorldId::generate();
        self.set_mapping_to(path, id);
        id
    }

    /// Map `path` to an existing world id, replacing any previous mapping.
    pub fn set_mapping_to(&self, path: &str, world: WorldId) {
        self.mappings.write().insert(normalize(path), world);
    }

    /// Remove the mapping for `path`. Absent paths are fine.
    pub fn delete_mapping(&self, path: &str) {
        self.mappings.write().remove(&normalize(path));
    }

    /// Remove the mapping for `path` only if it still points at `world`. Returns whether it did.
    pub fn delete_mapping_if(&self, path: &str, world: WorldId) -> bool {
        let key = normalize(path);
        let mut map = self.mappings.write();
        if map.get(&key) == Some(&world) {
            map.remove(&key);
            true
        } else {
            false
        }
    }

    /// World serving `path`: the mapping whose path is the longest segment-wise prefix.
    /// Equivalent spellings normalize to one key, so the most recent write wins.
    pub fn resolve(&self, path: &str) -> Option<WorldId> {
        let key = normalize(path);
        let map = self.mappings.read();
        let mut candidate = key.as_str();
        loop {
            if let Some(id) = map.get(candidate) {
                return Some(*id);
            }
            if candidate == "/" {
                return None;
            }
            candidate = match candidate.rfind('/') {
                Some(0) => "/",
                Some(i) => &candidate[..i],
                None => return None,
            };
        }
    }

    pub fn mappings(&self) -> Vec<(String, WorldId)> {
        let mut out: Vec<(String, WorldId)> = self
            .mappings
            .read()
            .iter()
            .map(|(p, id)| (p.clone(), *id))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("rooms//1/"), "/rooms/1");
        assert_eq!(normalize("/a/b"), "/a/b");
    }

    #[test]
    fn longest_prefix_wins() {
        let r = PathResolver::new();
        let w1 = r.set_mapping("/a");
        let w2 = r.set_mapping("/a/b");
        assert_eq!(r.resolve("/a/b/c"), Some(w2));
        assert_eq!(r.resolve("/a/z"), Some(w1));
        assert_eq!(r.resolve("/a"), Some(w1));
        assert_eq!(r.resolve("/ab"), None);
        assert_eq!(r.resolve("/other"), None);
    }

    #[test]
    fn root_mapping_catches_everything() {
        let r = PathResolver::new();
        let root = r.set_mapping("/");
        assert_eq!(r.resolve("/anything/at/all"), Some(root));
    }

    #[test]
    fn last_write_wins_and_delete_is_idempotent() {
        let r = PathResolver::new();
        let first = r.set_mapping("/lobby");
        let second = r.set_mapping("lobby/");
        assert_ne!(first, second);
        assert_eq!(r.resolve("/lobby/x"), Some(second));
        r.delete_mapping("/lobby");
        r.delete_mapping("/lobby");
        assert_eq!(r.resolve("/lobby"), None);
    }

    #[test]
    fn conditional_delete_keeps_replacement() {
        let r = PathResolver::new();
        let old = r.set_mapping("/w");
        let new = r.set_mapping("/w");
        assert!(!r.delete_mapping_if("/w", old));
        assert_eq!(r.resolve("/w"), Some(new));
        assert!(r.delete_mapping_if("/w", new));
    }

    #[test]
    fn shared_across_threads() {
        let r = Arc::new(PathResolver::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = r.clone();
                std::thread::spawn(move || {
                    r.set_mapping(&format!("/t/{i}"));
                    r.resolve(&format!("/t/{i}/x")).is_some()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(r.mappings().len(), 8);
    }
}
