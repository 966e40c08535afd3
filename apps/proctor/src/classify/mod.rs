//! Native vs managed classification of test sources.
//!
//! A classifier is scoped to one discovery or run session. Binaries may be
//! rebuilt between sessions, so results are cached per instance and never
//! shared.

pub mod pe;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::pe::{PeError, PeHeaders};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyType {
    #[default]
    Unknown,
    Native,
    Managed,
}

/// Applied when a file cannot be opened or its header cannot be parsed.
/// Callers downstream rely on a classified file never being `Unknown`.
pub const FALLBACK_ASSEMBLY_TYPE: AssemblyType = AssemblyType::Managed;

const CLASSIFIED_EXTENSIONS: &[&str] = &["dll", "exe"];

pub fn is_classifiable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CLASSIFIED_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

#[derive(Debug, Default)]
pub struct AssemblyClassifier {
    cache: Mutex<HashMap<PathBuf, AssemblyType>>,
}

impl AssemblyClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies one file. Failures are logged and resolve to
    /// [`FALLBACK_ASSEMBLY_TYPE`].
    pub fn classify(&self, path: impl AsRef<Path>) -> AssemblyType {
        let path = path.as_ref();
        if let Some(cached) = self.cache.lock().get(path) {
            return *cached;
        }

        let assembly_type = match read_headers(path) {
            Ok(headers) if headers.is_managed() => AssemblyType::Managed,
            Ok(_) => AssemblyType::Native,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    fallback = ?FALLBACK_ASSEMBLY_TYPE,
                    "failed to determine assembly type"
                );
                FALLBACK_ASSEMBLY_TYPE
            }
        };
        debug!(path = %path.display(), ?assembly_type, "classified source");

        *self
            .cache
            .lock()
            .entry(path.to_path_buf())
            .or_insert(assembly_type)
    }

    /// Classifies every source with a recognized binary extension. Other
    /// sources are left out of the map.
    pub fn detect_assembly_types<S: AsRef<str>>(
        &self,
        sources: &[S],
    ) -> HashMap<String, AssemblyType> {
        let mut types = HashMap::new();
        for source in sources {
            let source: &str = source.as_ref();
            if is_classifiable(Path::new(source)) {
                types.insert(source.to_string(), self.classify(source));
            }
        }
        types
    }
}

fn read_headers(path: &Path) -> Result<PeHeaders, PeError> {
    let file = File::open(path)?;
    PeHeaders::read(&mut BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn managed_header_is_managed_and_stripped_header_is_native() {
        let dir = tempfile::tempdir().expect("tempdir");
        let managed = dir.path().join("Tests.dll");
        let stripped = dir.path().join("Stripped.dll");
        fs::write(&managed, pe::fixture::image(true)).expect("write");
        fs::write(&stripped, pe::fixture::image(false)).expect("write");

        let classifier = AssemblyClassifier::new();
        assert_eq!(classifier.classify(&managed), AssemblyType::Managed);
        assert_eq!(classifier.classify(&stripped), AssemblyType::Native);
    }

    #[test]
    fn missing_file_falls_back_to_managed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let classifier = AssemblyClassifier::new();
        assert_eq!(
            classifier.classify(dir.path().join("absent.dll")),
            FALLBACK_ASSEMBLY_TYPE
        );
        assert_eq!(FALLBACK_ASSEMBLY_TYPE, AssemblyType::Managed);
    }

    #[test]
    fn unparsable_file_falls_back_to_managed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let garbage = dir.path().join("garbage.exe");
        fs::write(&garbage, b"definitely not an image").expect("write");
        assert_eq!(
            AssemblyClassifier::new().classify(&garbage),
            AssemblyType::Managed
        );
    }

    #[test]
    fn results_are_stable_within_a_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Rebuilt.dll");
        fs::write(&path, pe::fixture::image(false)).expect("write");

        let session = AssemblyClassifier::new();
        assert_eq!(session.classify(&path), AssemblyType::Native);

        fs::write(&path, pe::fixture::image(true)).expect("rewrite");
        assert_eq!(session.classify(&path), AssemblyType::Native);

        let next_session = AssemblyClassifier::new();
        assert_eq!(next_session.classify(&path), AssemblyType::Managed);
    }

    #[test]
    fn only_binary_extensions_are_classified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dll = dir.path().join("A.DLL");
        fs::write(&dll, pe::fixture::image(false)).expect("write");
        let dll = dll.to_string_lossy().into_owned();

        let types = AssemblyClassifier::new().detect_assembly_types(&[
            dll.clone(),
            "tests.js".to_string(),
            "suite.py".to_string(),
            "b.exe".to_string(),
        ]);

        assert_eq!(types.len(), 2);
        assert_eq!(types[&dll], AssemblyType::Native);
        assert_eq!(types["b.exe"], AssemblyType::Managed);
        assert!(!types.contains_key("tests.js"));
    }
}
