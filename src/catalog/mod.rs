//! Loaders for externally supplied values: exercise packs and product
//! specs. Both are anti-corruption boundaries: they read JSON files and
//! return domain values, never their own row or file shapes.

use crate::domain::{Exercise, ProductSpec};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Source of exercises, keyed by id.
pub trait ExerciseCatalog: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Exercise>>;
}

/// Source of product specs, addressed by path.
pub trait SpecSource: Send + Sync {
    fn load(&self, spec_path: &str) -> Result<Option<ProductSpec>>;
}

/// Directory of `<id>.json` exercise files.
pub struct JsonExerciseCatalog {
    dir: PathBuf,
}

impl JsonExerciseCatalog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl ExerciseCatalog for JsonExerciseCatalog {
    fn load(&self, id: &str) -> Result<Option<Exercise>> {
        // Ids are opaque but must stay inside the catalog directory.
        if id.contains(['/', '\\']) || id.contains("..") {
            return Ok(None);
        }
        let path = self.dir.join(format!("{id}.json"));
        match std::fs::read(&path) {
            Ok(bytes) => {
                let exercise = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt exercise file: {}", path.display()))?;
                Ok(Some(exercise))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

/// Product specs as JSON files; relative paths resolve against a base
/// directory.
pub struct JsonSpecSource {
    base: PathBuf,
}

impl JsonSpecSource {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }
}

impl SpecSource for JsonSpecSource {
    fn load(&self, spec_path: &str) -> Result<Option<ProductSpec>> {
        let raw = Path::new(spec_path);
        let path = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.base.join(raw)
        };
        match std::fs::read(&path) {
            Ok(bytes) => {
                let spec = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt spec file: {}", path.display()))?;
                Ok(Some(spec))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Difficulty, Recipe};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_exercise(dir: &Path, id: &str) {
        let exercise = Exercise {
            id: id.to_string(),
            title: "Two Sum".into(),
            difficulty: Difficulty::Beginner,
            description: "Find two numbers adding to a target.".into(),
            starter_code: BTreeMap::new(),
            test_code: BTreeMap::new(),
            hints_by_level: BTreeMap::new(),
            check_recipe: Recipe::default(),
        };
        std::fs::write(
            dir.join(format!("{id}.json")),
            serde_json::to_vec(&exercise).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn loads_existing_exercise() {
        let tmp = TempDir::new().unwrap();
        write_exercise(tmp.path(), "two-sum");
        let catalog = JsonExerciseCatalog::new(tmp.path());
        let exercise = catalog.load("two-sum").unwrap().unwrap();
        assert_eq!(exercise.title, "Two Sum");
        assert!(catalog.load("missing").unwrap().is_none());
    }

    #[test]
    fn rejects_traversal_ids() {
        let tmp = TempDir::new().unwrap();
        let catalog = JsonExerciseCatalog::new(tmp.path());
        assert!(catalog.load("../etc/passwd").unwrap().is_none());
        assert!(catalog.load("a/b").unwrap().is_none());
    }

    #[test]
    fn spec_source_resolves_relative_paths() {
        let tmp = TempDir::new().unwrap();
        let spec = ProductSpec {
            name: "checkout".into(),
            version: "1.0".into(),
            goals: vec![],
            features: vec![],
            acceptance_criteria: vec![],
            non_functional: vec![],
            milestones: vec![],
        };
        std::fs::write(
            tmp.path().join("checkout.json"),
            serde_json::to_vec(&spec).unwrap(),
        )
        .unwrap();

        let source = JsonSpecSource::new(tmp.path());
        assert!(source.load("checkout.json").unwrap().is_some());
        assert!(source.load("absent.json").unwrap().is_none());
    }
}
