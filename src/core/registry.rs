//! Archive driver registry
//!
//! Maps file name suffixes to drivers. Registries form a chain: a child
//! registry shadows the mappings of its parent, and a [`DriverSpec::Remove`]
//! mapping hides an inherited suffix.
//!
//! Mapping values are resolved lazily. A driver named by string or given as
//! a factory is instantiated on first lookup and the instance is stored back
//! into the map.

use crate::core::driver::FsDriver;
use crate::core::error::{FsError, Result};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Reserved for the list of suffixes detected by default.
pub const DEFAULT_KEYWORD: &str = "DEFAULT";

/// Separator of suffix lists.
pub const SUFFIX_SEPARATOR: char = '|';

/// Canonical list of file name suffixes: lower case, without leading dots,
/// without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuffixSet(IndexSet<String>);

impl SuffixSet {
    pub fn new() -> Self {
        SuffixSet::default()
    }

    /// Parses a `|` separated list such as `"zip|.JAR|tar.gz"`.
    pub fn parse(list: &str) -> Self {
        let mut set = SuffixSet::new();
        for suffix in list.split(SUFFIX_SEPARATOR) {
            set.insert(suffix);
        }
        set
    }

    /// Adds a suffix, returning false if it was empty or already present.
    pub fn insert(&mut self, suffix: &str) -> bool {
        let suffix = suffix.trim().trim_start_matches('.').to_lowercase();
        !suffix.is_empty() && self.0.insert(suffix)
    }

    pub fn remove(&mut self, suffix: &str) -> bool {
        self.0.shift_remove(&suffix.trim().trim_start_matches('.').to_lowercase())
    }

    pub fn contains(&self, suffix: &str) -> bool {
        self.0.contains(&suffix.trim_start_matches('.').to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.0.retain(|s| keep(s));
    }
}

impl fmt::Display for SuffixSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for suffix in &self.0 {
            if !first {
                write!(f, "{}", SUFFIX_SEPARATOR)?;
            }
            f.write_str(suffix)?;
            first = false;
        }
        Ok(())
    }
}

pub type DriverFactory = fn() -> Arc<dyn FsDriver>;

/// Value of a suffix mapping.
#[derive(Clone)]
pub enum DriverSpec {
    /// Name of a driver in the [`DriverCatalog`].
    Named(String),
    Factory(DriverFactory),
    Instance(Arc<dyn FsDriver>),
    /// Hides the mapping inherited from the parent registry.
    Remove,
}

impl fmt::Debug for DriverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverSpec::Named(name) => f.debug_tuple("Named").field(name).finish(),
            DriverSpec::Factory(_) => f.write_str("Factory"),
            DriverSpec::Instance(_) => f.write_str("Instance"),
            DriverSpec::Remove => f.write_str("Remove"),
        }
    }
}

type CatalogFactory = Arc<dyn Fn() -> Arc<dyn FsDriver> + Send + Sync>;

/// Named driver factories, for drivers configured by name.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: HashMap<String, CatalogFactory>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        DriverCatalog::default()
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn FsDriver> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn FsDriver>> {
        match self.factories.get(&name.to_lowercase()) {
            Some(factory) => Ok(factory()),
            None => Err(FsError::Config(format!("unknown archive driver '{}'", name))),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct DriverRegistry {
    parent: Option<Arc<DriverRegistry>>,
    catalog: Arc<DriverCatalog>,
    mappings: Mutex<IndexMap<String, DriverSpec>>,
    /// Suffixes detected by default. All registered suffixes when unset.
    defaults: Option<SuffixSet>,
}

impl DriverRegistry {
    /// Creates a registry with `mappings` from suffix lists to drivers.
    ///
    /// Fails if a suffix list is empty or uses the reserved
    /// [`DEFAULT_KEYWORD`].
    pub fn new<'a, I>(
        parent: Option<Arc<DriverRegistry>>,
        catalog: Arc<DriverCatalog>,
        mappings: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, DriverSpec)>,
    {
        let mut map = IndexMap::new();
        for (list, spec) in mappings {
            let suffixes = SuffixSet::parse(list);
            if suffixes.is_empty() {
                return Err(FsError::Config(format!("empty suffix list '{}'", list)));
            }
            if suffixes.iter().any(|s| s.eq_ignore_ascii_case(DEFAULT_KEYWORD)) {
                return Err(FsError::Config(format!(
                    "'{}' is reserved for the default suffixes",
                    DEFAULT_KEYWORD
                )));
            }
            for suffix in suffixes.iter() {
                map.insert(suffix.to_string(), spec.clone());
            }
        }
        Ok(DriverRegistry {
            parent,
            catalog,
            mappings: Mutex::new(map),
            defaults: None,
        })
    }

    /// Restricts detection to `suffixes`.
    pub fn with_default_suffixes(mut self, suffixes: SuffixSet) -> Self {
        self.defaults = Some(suffixes);
        self
    }

    pub fn parent(&self) -> Option<&Arc<DriverRegistry>> {
        self.parent.as_ref()
    }

    /// Driver for `suffix`, searching the parent chain. `None` if unmapped
    /// or removed.
    pub fn driver(&self, suffix: &str) -> Result<Option<Arc<dyn FsDriver>>> {
        let key = suffix.trim_start_matches('.').to_lowercase();
        let mut mappings = self.mappings.lock();
        let resolved = match mappings.get(&key) {
            None => None,
            Some(DriverSpec::Remove) => return Ok(None),
            Some(DriverSpec::Instance(driver)) => return Ok(Some(driver.clone())),
            Some(DriverSpec::Named(name)) => Some(self.catalog.create(name)?),
            Some(DriverSpec::Factory(factory)) => Some(factory()),
        };
        let Some(driver) = resolved else {
            drop(mappings);
            return match &self.parent {
                Some(parent) => parent.driver(&key),
                None => Ok(None),
            };
        };
        debug!("Resolved archive driver for suffix '{}'", key);
        mappings.insert(key, DriverSpec::Instance(driver.clone()));
        Ok(Some(driver))
    }

    /// All suffixes mapped to a driver anywhere in the chain.
    pub fn suffixes(&self) -> SuffixSet {
        let mut set = match &self.parent {
            Some(parent) => parent.suffixes(),
            None => SuffixSet::new(),
        };
        for (suffix, spec) in self.mappings.lock().iter() {
            match spec {
                DriverSpec::Remove => set.remove(suffix),
                _ => set.insert(suffix),
            };
        }
        set
    }

    /// Suffixes recognized by [`detect`](Self::detect).
    pub fn detectable(&self) -> SuffixSet {
        let mut set = self.suffixes();
        if let Some(defaults) = &self.defaults {
            set.retain(|s| defaults.contains(s));
        }
        set
    }

    /// Finds the driver for a file name by its longest detectable suffix.
    pub fn detect(&self, file_name: &str) -> Result<Option<(String, Arc<dyn FsDriver>)>> {
        let lower = file_name.to_lowercase();
        let mut best: Option<String> = None;
        for suffix in self.detectable().iter() {
            let matches = lower.len() > suffix.len() + 1
                && lower.ends_with(suffix)
                && lower.as_bytes()[lower.len() - suffix.len() - 1] == b'.';
            if matches && best.as_ref().map_or(true, |b| suffix.len() > b.len()) {
                best = Some(suffix.to_string());
            }
        }
        match best {
            Some(suffix) => Ok(self.driver(&suffix)?.map(|driver| (suffix, driver))),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("suffixes", &self.suffixes().to_string())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::controller::{FsController, SharedController};
    use crate::core::model::FsModel;

    struct Dummy;

    impl FsDriver for Dummy {
        fn new_controller(
            self: Arc<Self>,
            _model: Arc<FsModel>,
            _parent: SharedController,
        ) -> Box<dyn FsController> {
            unimplemented!()
        }
    }

    fn dummy() -> Arc<dyn FsDriver> {
        Arc::new(Dummy)
    }

    fn catalog() -> Arc<DriverCatalog> {
        let mut catalog = DriverCatalog::new();
        catalog.register("dummy", dummy);
        Arc::new(catalog)
    }

    #[test]
    fn test_suffix_set_canonical_form() {
        let set = SuffixSet::parse("ZIP|.jar||zip| tar.gz ");
        assert_eq!(set.to_string(), "zip|jar|tar.gz");
        assert!(set.contains(".JAR"));
    }

    #[test]
    fn test_rejects_empty_and_reserved_lists() {
        let empty = DriverRegistry::new(None, catalog(), [("|", DriverSpec::Factory(dummy))]);
        assert!(matches!(empty, Err(FsError::Config(_))));

        let reserved = DriverRegistry::new(None, catalog(), [("zip|default", DriverSpec::Factory(dummy))]);
        assert!(matches!(reserved, Err(FsError::Config(_))));
    }

    #[test]
    fn test_named_driver_is_resolved_once() {
        let registry =
            DriverRegistry::new(None, catalog(), [("zip", DriverSpec::Named("dummy".into()))]).unwrap();
        let first = registry.driver("zip").unwrap().unwrap();
        let second = registry.driver(".ZIP").unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_name_fails() {
        let registry =
            DriverRegistry::new(None, catalog(), [("zip", DriverSpec::Named("nope".into()))]).unwrap();
        assert!(matches!(registry.driver("zip"), Err(FsError::Config(_))));
    }

    #[test]
    fn test_child_shadows_and_removes() {
        let parent = Arc::new(
            DriverRegistry::new(None, catalog(), [("zip|jar|tar", DriverSpec::Factory(dummy))]).unwrap(),
        );
        let child = DriverRegistry::new(
            Some(parent.clone()),
            catalog(),
            [("jar", DriverSpec::Remove), ("tar.gz", DriverSpec::Factory(dummy))],
        )
        .unwrap();

        assert_eq!(child.suffixes().to_string(), "zip|tar|tar.gz");
        assert!(child.driver("jar").unwrap().is_none());
        assert!(parent.driver("jar").unwrap().is_some());
        assert!(child.driver("zip").unwrap().is_some());
    }

    #[test]
    fn test_detect_prefers_longest_suffix() {
        let registry = DriverRegistry::new(
            None,
            catalog(),
            [("gz", DriverSpec::Factory(dummy)), ("tar.gz", DriverSpec::Factory(dummy))],
        )
        .unwrap();

        let (suffix, _) = registry.detect("Backup.TAR.GZ").unwrap().unwrap();
        assert_eq!(suffix, "tar.gz");
        assert!(registry.detect("tar.gz").unwrap().is_some());
        assert!(registry.detect(".gz").unwrap().is_none());
        assert!(registry.detect("notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_default_suffixes_limit_detection() {
        let registry = DriverRegistry::new(None, catalog(), [("zip|jar", DriverSpec::Factory(dummy))])
            .unwrap()
            .with_default_suffixes(SuffixSet::parse("zip"));

        assert!(registry.detect("a.zip").unwrap().is_some());
        assert!(registry.detect("a.jar").unwrap().is_none());
        assert!(registry.driver("jar").unwrap().is_some());
    }
}
