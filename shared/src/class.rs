//! Class templates: the shared immutable metadata behind objects
//!
//! A class lives in a package directory as `<class>.json`. Servers read
//! them from disk; clients read local copies and fall back to asking the
//! server for the file when they have none.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// File extension of class metadata files
pub const CLASS_FILE_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum ClassError {
    #[error("invalid package or class name {0:?}")]
    InvalidName(String),
    #[error("failed to read class file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse class file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Identifies a class template by package and class name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassRef {
    pub package: String,
    pub name: String,
}

impl ClassRef {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }

    /// Name of the file holding this class inside its package
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, CLASS_FILE_EXT)
    }
}

impl std::fmt::Display for ClassRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.package, self.name)
    }
}

/// Display and geometry metadata shared by every instance of a class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    pub width: f32,
    pub height: f32,
    /// Image shown when an instance is flipped
    #[serde(default)]
    pub back: Option<String>,
    /// Snap grid size in table units
    #[serde(default)]
    pub grid: Option<f32>,
    /// One image per variant
    #[serde(default)]
    pub images: Vec<String>,
}

impl ClassInfo {
    pub fn sized(name: impl Into<String>, width: f32, height: f32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            back: None,
            grid: None,
            images: Vec::new(),
        }
    }

    /// Zero-sized stand-in for a class whose file has not arrived yet
    pub fn placeholder() -> Self {
        Self::sized("", 0.0, 0.0)
    }

    pub fn parse(text: &str) -> Result<Self, ClassError> {
        let mut info: ClassInfo = serde_json::from_str(text)?;
        info.width = sanitize_size(info.width);
        info.height = sanitize_size(info.height);
        Ok(info)
    }

    pub fn variant_count(&self) -> usize {
        self.images.len().max(1)
    }

    pub fn is_valid_variant(&self, variant: u8) -> bool {
        usize::from(variant) < self.variant_count()
    }
}

fn sanitize_size(value: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Rejects names that could escape the package root
///
/// Names come straight off the wire, so anything that is not a single plain
/// path component is refused.
pub fn validate_name(name: &str) -> Result<(), ClassError> {
    let bad = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\', '\0']);
    if bad {
        Err(ClassError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Source of class files
pub trait PackageLoader: Send + Sync {
    fn read_text(&self, package: &str, file: &str) -> Result<String, ClassError>;
}

/// Reads `<root>/<package>/<file>` from disk
#[derive(Debug, Clone)]
pub struct DirPackageLoader {
    root: PathBuf,
}

impl DirPackageLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PackageLoader for DirPackageLoader {
    fn read_text(&self, package: &str, file: &str) -> Result<String, ClassError> {
        validate_name(package)?;
        validate_name(file)?;
        let path = self.root.join(package).join(file);
        Ok(fs::read_to_string(path)?)
    }
}

/// In-memory package store
#[derive(Debug, Clone, Default)]
pub struct MemoryPackages {
    files: HashMap<(String, String), String>,
}

impl MemoryPackages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, package: &str, file: &str, text: impl Into<String>) {
        self.files
            .insert((package.to_string(), file.to_string()), text.into());
    }

    /// Stores a class under its conventional file name
    pub fn with_class(mut self, package: &str, class: &str, info: &ClassInfo) -> Self {
        let file = ClassRef::new(package, class).file_name();
        // Serialising a plain struct of strings and floats cannot fail
        let text = serde_json::to_string(info).unwrap_or_default();
        self.insert(package, &file, text);
        self
    }
}

impl PackageLoader for MemoryPackages {
    fn read_text(&self, package: &str, file: &str) -> Result<String, ClassError> {
        validate_name(package)?;
        validate_name(file)?;
        self.files
            .get(&(package.to_string(), file.to_string()))
            .cloned()
            .ok_or_else(|| {
                ClassError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}/{}", package, file),
                ))
            })
    }
}

/// Lazily filled cache of loaded classes
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: HashMap<ClassRef, Arc<ClassInfo>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: &ClassRef) -> Option<Arc<ClassInfo>> {
        self.classes.get(class).cloned()
    }

    pub fn contains(&self, class: &ClassRef) -> bool {
        self.classes.contains_key(class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns the cached class or loads it through `loader`
    pub fn load(
        &mut self,
        class: &ClassRef,
        loader: &dyn PackageLoader,
    ) -> Result<Arc<ClassInfo>, ClassError> {
        if let Some(info) = self.classes.get(class) {
            return Ok(info.clone());
        }
        validate_name(&class.name)?;
        let text = loader.read_text(&class.package, &class.file_name())?;
        self.insert_text(class, &text)
    }

    /// Registers a class from raw file text. An already loaded class is kept.
    pub fn insert_text(&mut self, class: &ClassRef, text: &str) -> Result<Arc<ClassInfo>, ClassError> {
        if let Some(info) = self.classes.get(class) {
            return Ok(info.clone());
        }
        let info = Arc::new(ClassInfo::parse(text)?);
        debug!("Registered class {} ({}x{})", class, info.width, info.height);
        self.classes.insert(class.clone(), info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAWN: &str = r#"{ "name": "Pawn", "width": 40, "height": 40, "grid": 50, "images": ["white", "black"] }"#;

    #[test]
    fn test_parse_class_file() {
        let info = ClassInfo::parse(PAWN).unwrap();
        assert_eq!(info.name, "Pawn");
        assert_eq!(info.width, 40.0);
        assert_eq!(info.grid, Some(50.0));
        assert_eq!(info.back, None);
        assert_eq!(info.variant_count(), 2);
        assert!(info.is_valid_variant(1));
        assert!(!info.is_valid_variant(2));
    }

    #[test]
    fn test_variant_zero_always_valid() {
        let info = ClassInfo::sized("Token", 10.0, 10.0);
        assert_eq!(info.variant_count(), 1);
        assert!(info.is_valid_variant(0));
        assert!(!info.is_valid_variant(1));
    }

    #[test]
    fn test_negative_size_is_sanitized() {
        let info = ClassInfo::parse(r#"{ "name": "Bad", "width": -3, "height": 5 }"#).unwrap();
        assert_eq!(info.width, 0.0);
        assert_eq!(info.height, 5.0);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            ClassInfo::parse("{ not json"),
            Err(ClassError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("chess").is_ok());
        assert!(validate_name("pawn.json").is_ok());
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(validate_name(bad), Err(ClassError::InvalidName(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_registry_loads_lazily_and_caches() {
        let packages = MemoryPackages::new().with_class(
            "chess",
            "pawn",
            &ClassInfo::sized("Pawn", 40.0, 40.0),
        );
        let mut registry = ClassRegistry::new();
        let pawn = ClassRef::new("chess", "pawn");
        assert!(registry.get(&pawn).is_none());

        let first = registry.load(&pawn, &packages).unwrap();
        let second = registry.load(&pawn, &MemoryPackages::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_missing_class() {
        let mut registry = ClassRegistry::new();
        let missing = ClassRef::new("chess", "queen");
        assert!(matches!(
            registry.load(&missing, &MemoryPackages::new()),
            Err(ClassError::Io(_))
        ));
        assert!(!registry.contains(&missing));
    }

    #[test]
    fn test_registry_rejects_traversal() {
        let mut registry = ClassRegistry::new();
        let sneaky = ClassRef::new("..", "passwd");
        assert!(matches!(
            registry.load(&sneaky, &DirPackageLoader::new("/tmp")),
            Err(ClassError::InvalidName(_))
        ));
    }

    #[test]
    fn test_insert_text_keeps_first_version() {
        let mut registry = ClassRegistry::new();
        let pawn = ClassRef::new("chess", "pawn");
        registry.insert_text(&pawn, PAWN).unwrap();
        let again = registry
            .insert_text(&pawn, r#"{ "name": "Other", "width": 1, "height": 1 }"#)
            .unwrap();
        assert_eq!(again.name, "Pawn");
    }

    #[test]
    fn test_dir_loader_reads_files() {
        let root = std::env::temp_dir().join(format!("tabletop-classes-{}", std::process::id()));
        fs::create_dir_all(root.join("chess")).unwrap();
        fs::write(root.join("chess").join("pawn.json"), PAWN).unwrap();

        let loader = DirPackageLoader::new(&root);
        let mut registry = ClassRegistry::new();
        let info = registry.load(&ClassRef::new("chess", "pawn"), &loader).unwrap();
        assert_eq!(info.name, "Pawn");

        fs::remove_dir_all(&root).unwrap();
    }
}
