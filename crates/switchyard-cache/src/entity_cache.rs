use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

/// Process-local map of id to current value
///
/// Entries never expire; they change only through `set`, `remove` and
/// `replace_all`. Values are shared as `Arc<V>` so readers never clone
/// the entity itself.
#[derive(Debug)]
pub struct EntityCache<V> {
    entries: DashMap<String, Arc<V>>,
}

impl<V> Default for EntityCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> EntityCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the shared handle
    pub fn set(&self, id: impl Into<String>, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.entries.insert(id.into(), Arc::clone(&value));
        value
    }

    /// Insert or replace an already shared value, returning the previous one
    pub fn set_arc(&self, id: impl Into<String>, value: Arc<V>) -> Option<Arc<V>> {
        self.entries.insert(id.into(), value)
    }

    pub fn get(&self, id: &str) -> Option<Arc<V>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<V>> {
        self.entries.remove(id).map(|(_, value)| value)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the value under `id` with `f(current)` while holding the entry lock
    ///
    /// Returns the new value, or `None` when the id is not cached.
    pub fn update(&self, id: &str, f: impl FnOnce(&V) -> V) -> Option<Arc<V>> {
        let mut entry = self.entries.get_mut(id)?;
        let next = Arc::new(f(entry.value()));
        *entry.value_mut() = Arc::clone(&next);
        Some(next)
    }

    /// Conditionally replace the value under `id` while holding the entry lock
    ///
    /// `f` returns `None` to leave the entry untouched. Returns the
    /// previous and new values when a replacement happened, so exactly one
    /// of several racing callers observes the transition.
    pub fn try_update(&self, id: &str, f: impl FnOnce(&V) -> Option<V>) -> Option<(Arc<V>, Arc<V>)> {
        let mut entry = self.entries.get_mut(id)?;
        let next = Arc::new(f(entry.value())?);
        let previous = std::mem::replace(entry.value_mut(), Arc::clone(&next));
        Some((previous, next))
    }

    /// Swap in a whole generation
    ///
    /// New entries are inserted before stale ids are removed, so a
    /// concurrent reader sees either the old or the new value for a
    /// surviving id and never an empty cache.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, V)>) {
        let mut live = HashSet::new();
        for (id, value) in entries {
            live.insert(id.clone());
            self.entries.insert(id, Arc::new(value));
        }
        self.entries.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let cache = EntityCache::new();
        cache.set("a", 1);
        cache.set("b", 2);

        assert_eq!(cache.get("a").as_deref(), Some(&1));
        assert_eq!(cache.remove("a").as_deref(), Some(&1));
        assert!(cache.get("a").is_none());

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["b".to_owned()]);
    }

    #[test]
    fn replace_all_drops_stale_ids() {
        let cache = EntityCache::new();
        cache.set("a", 1);
        cache.set("b", 2);

        cache.replace_all([("b".to_owned(), 20), ("c".to_owned(), 30)]);

        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").as_deref(), Some(&20));
        assert_eq!(cache.get("c").as_deref(), Some(&30));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn update_only_touches_cached_ids() {
        let cache = EntityCache::new();
        cache.set("a", 1);

        assert_eq!(cache.update("a", |v| v + 1).as_deref(), Some(&2));
        assert!(cache.update("missing", |v| v + 1).is_none());
        assert!(!cache.contains("missing"));
    }

    #[test]
    fn try_update_reports_transition_once() {
        let cache = EntityCache::new();
        cache.set("a", false);

        let flip = |enabled: &bool| if *enabled { None } else { Some(true) };
        let (previous, next) = cache.try_update("a", flip).unwrap();
        assert!(!*previous);
        assert!(*next);
        assert!(cache.try_update("a", flip).is_none());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cache = EntityCache::new();
        let before = cache.set("a", String::from("old"));
        cache.set("a", String::from("new"));

        assert_eq!(*before, "old");
        assert_eq!(cache.get("a").as_deref().map(String::as_str), Some("new"));
    }
}
