//! Extension search paths and the discoverer capability table.
//!
//! Discoverers register a static [`DiscovererCapability`] up front instead of
//! being found by scanning binaries. Search paths only tell the test host where
//! adapters live.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::classify::AssemblyType;

const NATIVE_MARKER: &str = "_native_";
const MANAGED_MARKER: &str = "_managed_";

/// What a discoverer declares about itself.
#[derive(Debug, Clone, Default)]
pub struct CapabilityDeclaration<'a> {
    pub name: &'a str,
    pub default_executor_uri: &'a str,
    /// File extensions such as `.dll`. The markers `_native_` and `_managed_`
    /// are not extensions; they pin the assembly type.
    pub file_extensions: &'a [&'a str],
    /// `"native"` or `"managed"`; anything else leaves the type unknown.
    pub assembly_type: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscovererCapability {
    pub name: String,
    pub file_extensions: Vec<String>,
    pub default_executor_uri: String,
    pub assembly_type: AssemblyType,
}

impl DiscovererCapability {
    pub fn from_declaration(declaration: &CapabilityDeclaration<'_>) -> Self {
        let mut assembly_type = AssemblyType::Unknown;
        let mut file_extensions = Vec::new();
        for extension in declaration.file_extensions.iter().filter(|e| !e.is_empty()) {
            let marked = match *extension {
                NATIVE_MARKER => Some(AssemblyType::Native),
                MANAGED_MARKER => Some(AssemblyType::Managed),
                _ => None,
            };
            match marked {
                Some(marked) if assembly_type == AssemblyType::Unknown => assembly_type = marked,
                Some(_) => {}
                None => file_extensions.push(extension.to_string()),
            }
        }
        if assembly_type == AssemblyType::Unknown {
            assembly_type = match declaration.assembly_type {
                Some("native") => AssemblyType::Native,
                Some("managed") => AssemblyType::Managed,
                _ => AssemblyType::Unknown,
            };
        }
        Self {
            name: declaration.name.to_string(),
            file_extensions,
            default_executor_uri: declaration.default_executor_uri.to_string(),
            assembly_type,
        }
    }

    /// True when the source's extension is declared and its assembly type does
    /// not contradict the declared one.
    pub fn supports(&self, source: &Path, assembly_type: AssemblyType) -> bool {
        let Some(extension) = source.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        let extension_matches = self.file_extensions.iter().any(|declared| {
            declared
                .trim_start_matches('.')
                .eq_ignore_ascii_case(extension)
        });
        extension_matches
            && (self.assembly_type == AssemblyType::Unknown
                || assembly_type == AssemblyType::Unknown
                || self.assembly_type == assembly_type)
    }
}

#[derive(Debug, Default)]
pub struct ExtensionManager {
    search_paths: Vec<PathBuf>,
    only_well_known: bool,
    well_known: HashSet<String>,
    capabilities: Vec<DiscovererCapability>,
}

impl ExtensionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extension file names allowed when only well-known extensions are used.
    pub fn with_well_known<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.well_known = names
            .into_iter()
            .map(|name| name.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    /// Merges `paths` into the search set; already known paths are skipped.
    pub fn use_additional_extensions<I, P>(&mut self, paths: I, only_well_known: bool)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut added = 0usize;
        for path in paths {
            let path = path.into();
            if !self.search_paths.contains(&path) {
                debug!(path = %path.display(), "adding extension search path");
                self.search_paths.push(path);
                added += 1;
            }
        }
        self.only_well_known = only_well_known;
        info!(
            added,
            total = self.search_paths.len(),
            only_well_known,
            "extension search paths updated"
        );
    }

    pub fn register(&mut self, capability: DiscovererCapability) {
        debug!(name = %capability.name, assembly_type = ?capability.assembly_type, "registered discoverer");
        self.capabilities.retain(|existing| existing.name != capability.name);
        self.capabilities.push(capability);
    }

    /// Every search path that was merged in, regardless of the allow-list.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Search paths the session should hand to the test host.
    pub fn effective_paths(&self) -> Vec<PathBuf> {
        self.search_paths
            .iter()
            .filter(|path| !self.only_well_known || self.is_well_known(path))
            .cloned()
            .collect()
    }

    pub fn discoverers_for(
        &self,
        source: &Path,
        assembly_type: AssemblyType,
    ) -> Vec<&DiscovererCapability> {
        self.capabilities
            .iter()
            .filter(|capability| capability.supports(source, assembly_type))
            .collect()
    }

    fn is_well_known(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.well_known.contains(&name.to_ascii_lowercase()))
    }
}
