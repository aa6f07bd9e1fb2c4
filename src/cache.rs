//! Per-worker in-memory dictionary caches
//!
//! Each worker owns one `DictionaryCache` for the lifetime of its consumer.
//! Entries map dictionary names to database ids and are never evicted; an id
//! is written only if the name is absent, so a cached id can never change out
//! from under the loader. The database UNIQUE constraints are the source of
//! truth — peer workers may race ahead of this cache but never contradict it.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Dictionary tables the loader resolves names against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dictionary {
    Region,
    District,
    City,
    Category,
    Subcategory,
    Company,
}

/// Fixed preload order. Every worker touches the dictionary tables in this
/// sequence so that concurrent batches acquire row locks in the same order;
/// `region` is always the first table contacted.
pub const PRELOAD_ORDER: [Dictionary; 5] = [
    Dictionary::Region,
    Dictionary::District,
    Dictionary::City,
    Dictionary::Category,
    Dictionary::Subcategory,
];

impl Dictionary {
    /// Database table name.
    pub fn table(self) -> &'static str {
        match self {
            Dictionary::Region => "region",
            Dictionary::District => "district",
            Dictionary::City => "city",
            Dictionary::Category => "category",
            Dictionary::Subcategory => "subcategory",
            Dictionary::Company => "company",
        }
    }
}

#[derive(Default)]
struct Maps {
    region: HashMap<String, i64>,
    district: HashMap<String, i64>,
    city: HashMap<String, i64>,
    category: HashMap<String, i64>,
    subcategory: HashMap<String, i64>,
    company: HashMap<String, i64>,
    geo: HashMap<String, i64>,
}

impl Maps {
    fn map(&self, dict: Dictionary) -> &HashMap<String, i64> {
        match dict {
            Dictionary::Region => &self.region,
            Dictionary::District => &self.district,
            Dictionary::City => &self.city,
            Dictionary::Category => &self.category,
            Dictionary::Subcategory => &self.subcategory,
            Dictionary::Company => &self.company,
        }
    }

    fn map_mut(&mut self, dict: Dictionary) -> &mut HashMap<String, i64> {
        match dict {
            Dictionary::Region => &mut self.region,
            Dictionary::District => &mut self.district,
            Dictionary::City => &mut self.city,
            Dictionary::Category => &mut self.category,
            Dictionary::Subcategory => &mut self.subcategory,
            Dictionary::Company => &mut self.company,
        }
    }
}

/// Thread-safe name → id cache for all dictionary tables plus the composite
/// geo identity. Reads from the worker's control path (summaries) may overlap
/// loader writes, hence the reader-writer lock.
#[derive(Default)]
pub struct DictionaryCache {
    inner: RwLock<Maps>,
}

impl DictionaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a name. Empty names never resolve.
    pub fn get(&self, dict: Dictionary, name: &str) -> Option<i64> {
        if name.is_empty() {
            return None;
        }
        self.inner.read().map(dict).get(name).copied()
    }

    /// Store an id for a name, only if the name is absent. Returns `true`
    /// when this call inserted the entry.
    pub fn insert(&self, dict: Dictionary, name: &str, id: i64) -> bool {
        let mut maps = self.inner.write();
        let map = maps.map_mut(dict);
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_string(), id);
        true
    }

    /// Names from `names` that are not cached yet, in input order.
    pub fn missing<'a>(&self, dict: Dictionary, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let maps = self.inner.read();
        let map = maps.map(dict);
        names
            .into_iter()
            .filter(|name| !map.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// Number of cached entries for one dictionary.
    pub fn len(&self, dict: Dictionary) -> usize {
        self.inner.read().map(dict).len()
    }

    /// Look up a geo id by its canonical triple key.
    pub fn geo_id(&self, key: &str) -> Option<i64> {
        self.inner.read().geo.get(key).copied()
    }

    /// Store a geo id for a canonical triple key, only if absent.
    pub fn insert_geo(&self, key: &str, id: i64) {
        let mut maps = self.inner.write();
        maps.geo.entry(key.to_string()).or_insert(id);
    }
}

/// Canonical geo identity key: `"<region>:<district>:<city>"` with empty
/// slots standing in for NULL. Matches the NULL-equals-NULL uniqueness of the
/// `geo` table.
pub fn geo_key(region: Option<i64>, district: Option<i64>, city: Option<i64>) -> String {
    let slot = |id: Option<i64>| id.map(|v| v.to_string()).unwrap_or_default();
    format!("{}:{}:{}", slot(region), slot(district), slot(city))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_unknown_and_empty_names() {
        let cache = DictionaryCache::new();
        assert_eq!(cache.get(Dictionary::Region, "Сибирь"), None);
        cache.insert(Dictionary::Region, "", 1);
        assert_eq!(cache.get(Dictionary::Region, ""), None);
    }

    #[test]
    fn insert_is_write_if_absent() {
        let cache = DictionaryCache::new();
        assert!(cache.insert(Dictionary::City, "Омск", 7));
        // A second id for the same name must not replace the first.
        assert!(!cache.insert(Dictionary::City, "Омск", 99));
        assert_eq!(cache.get(Dictionary::City, "Омск"), Some(7));
    }

    #[test]
    fn dictionaries_are_independent() {
        let cache = DictionaryCache::new();
        cache.insert(Dictionary::Category, "Еда", 1);
        assert_eq!(cache.get(Dictionary::Subcategory, "Еда"), None);
        assert_eq!(cache.len(Dictionary::Category), 1);
        assert_eq!(cache.len(Dictionary::Subcategory), 0);
    }

    #[test]
    fn missing_filters_cached_names() {
        let cache = DictionaryCache::new();
        cache.insert(Dictionary::Region, "Р1", 1);
        let names = vec!["Р1".to_string(), "Р2".to_string(), "Р3".to_string()];
        assert_eq!(cache.missing(Dictionary::Region, &names), vec!["Р2", "Р3"]);
    }

    #[test]
    fn geo_key_uses_empty_slots_for_null() {
        assert_eq!(geo_key(Some(1), None, Some(3)), "1::3");
        assert_eq!(geo_key(None, None, None), "::");
        assert_eq!(geo_key(Some(10), Some(20), Some(30)), "10:20:30");
    }

    #[test]
    fn geo_entries_are_write_if_absent() {
        let cache = DictionaryCache::new();
        cache.insert_geo("1::3", 5);
        cache.insert_geo("1::3", 8);
        assert_eq!(cache.geo_id("1::3"), Some(5));
        assert_eq!(cache.geo_id("2::3"), None);
    }

    #[test]
    fn preload_order_starts_with_region() {
        assert_eq!(PRELOAD_ORDER[0], Dictionary::Region);
        assert_eq!(PRELOAD_ORDER.map(Dictionary::table), ["region", "district", "city", "category", "subcategory"]);
    }
}
