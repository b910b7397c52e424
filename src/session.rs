//! Keyed registry of live sessions.
//!
//! A server builds one [`SessionContainer`] and hands clones to whatever
//! needs lookup by identifier. Clones share the same map.

use std::sync::Arc;

use dashmap::DashMap;

/// Concurrent map from session identifier to session handle.
#[derive(Debug)]
pub struct SessionContainer<T> {
    sessions: Arc<DashMap<String, T>>,
}

impl<T> Clone for SessionContainer<T> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<T> Default for SessionContainer<T> {
    fn default() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl<T: Clone> SessionContainer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, returning the one it replaced.
    pub fn insert(&self, id: impl Into<String>, session: T) -> Option<T> {
        self.sessions.insert(id.into(), session)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of the registered identifiers.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<T> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let container = SessionContainer::new();
        assert!(container.is_empty());

        assert!(container.insert("a", 1).is_none());
        assert_eq!(container.insert("a", 2), Some(1));
        container.insert("b", 3);

        assert_eq!(container.get("a"), Some(2));
        assert_eq!(container.len(), 2);
        let mut ids = container.ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(container.remove("a"), Some(2));
        assert!(!container.contains("a"));
        assert!(container.get("a").is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let container = SessionContainer::new();
        let other = container.clone();
        other.insert("x", "session");
        assert_eq!(container.get("x"), Some("session"));
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let container = SessionContainer::new();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let container = container.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..50 {
                    container.insert(format!("{i}-{j}"), j);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(container.len(), 16 * 50);
    }
}
