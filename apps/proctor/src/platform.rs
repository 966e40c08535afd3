//! Entry point for callers: turns discovery and run criteria into requests
//! bound to a resolved test host manager.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::classify::{AssemblyClassifier, AssemblyType, FALLBACK_ASSEMBLY_TYPE};
use crate::config::ProctorConfig;
use crate::criteria::{DiscoveryCriteria, RunCriteria};
use crate::extensions::{DiscovererCapability, ExtensionManager};
use crate::host::{DefaultTestHostManager, HostManagerFactory, HostManagerRegistry, TestHostManager};
use crate::request::{DiscoveryRequest, SessionOptions, TestRunRequest};
use crate::settings::{RunConfiguration, SettingsError, parse_run_configuration};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid argument: {0}")]
    Settings(#[from] SettingsError),
}

pub struct TestPlatform {
    config: ProctorConfig,
    registry: HostManagerRegistry,
    extensions: RwLock<ExtensionManager>,
}

impl TestPlatform {
    /// Platform whose only host manager spawns `config.testhost_path`.
    pub fn new(config: ProctorConfig) -> Self {
        let executable = config.testhost_path.clone();
        let fallback: HostManagerFactory =
            Arc::new(move || Box::new(DefaultTestHostManager::new(executable.clone())));
        Self::with_registry(config, HostManagerRegistry::new(fallback))
    }

    pub fn with_registry(config: ProctorConfig, registry: HostManagerRegistry) -> Self {
        Self {
            config,
            registry,
            extensions: RwLock::new(ExtensionManager::new()),
        }
    }

    /// Replaces the extension manager, e.g. to install an allow-list.
    pub fn with_extension_manager(mut self, extensions: ExtensionManager) -> Self {
        self.extensions = RwLock::new(extensions);
        self
    }

    pub fn config(&self) -> &ProctorConfig {
        &self.config
    }

    pub fn initialize_extensions<I, P>(&self, paths: I, only_well_known: bool)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.extensions
            .write()
            .use_additional_extensions(paths, only_well_known);
    }

    pub fn update_extensions<I, P>(&self, paths: I, only_well_known: bool)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.extensions
            .write()
            .use_additional_extensions(paths, only_well_known);
    }

    pub fn register_discoverer(&self, capability: DiscovererCapability) {
        self.extensions.write().register(capability);
    }

    pub fn effective_extensions(&self) -> Vec<PathBuf> {
        self.extensions.read().effective_paths()
    }

    /// Returns a request in the `Created` state; nothing is launched until
    /// the caller starts it.
    pub fn create_discovery_request(
        &self,
        criteria: DiscoveryCriteria,
    ) -> Result<DiscoveryRequest, PlatformError> {
        if criteria.sources().is_empty() {
            return Err(PlatformError::InvalidArgument(
                "discovery criteria has no sources".to_string(),
            ));
        }
        let run_configuration = parse_run_configuration(criteria.run_settings())?;
        let (host_manager, options) = self.prepare(criteria.sources(), &run_configuration);
        let request = DiscoveryRequest::new(criteria, host_manager, options);
        info!(session = %request.id(), "discovery request created");
        Ok(request)
    }

    pub fn create_run_request(&self, criteria: RunCriteria) -> Result<TestRunRequest, PlatformError> {
        if criteria.sources().is_empty() && !criteria.has_specific_tests() {
            return Err(PlatformError::InvalidArgument(
                "run criteria has neither sources nor tests".to_string(),
            ));
        }
        let run_configuration = parse_run_configuration(criteria.run_settings())?;
        let (mut host_manager, options) = self.prepare(criteria.sources(), &run_configuration);
        if let Some(launcher) = criteria.test_host_launcher() {
            host_manager.set_custom_launcher(Arc::clone(launcher));
        }
        let request = TestRunRequest::new(criteria, host_manager, options);
        info!(session = %request.id(), "run request created");
        Ok(request)
    }

    fn prepare(
        &self,
        sources: &[String],
        run_configuration: &RunConfiguration,
    ) -> (Box<dyn TestHostManager>, SessionOptions) {
        // A fresh classifier per request keeps the cache session scoped.
        let classifier = AssemblyClassifier::new();
        let types = classifier.detect_assembly_types(sources);
        let assembly_type = dominant_assembly_type(&types);

        let host_manager = self.registry.resolve(
            run_configuration.target_platform,
            run_configuration.target_framework.as_deref(),
            assembly_type,
        );
        debug!(
            manager = host_manager.name(),
            platform = %run_configuration.target_platform,
            framework = ?run_configuration.target_framework,
            ?assembly_type,
            "host manager resolved"
        );

        let mut options = SessionOptions::resolve(&self.config, run_configuration);
        let extensions = self.extensions.read();
        options.extensions = extensions.effective_paths();
        for source in sources {
            let source_type = types
                .get(source.as_str())
                .copied()
                .unwrap_or(AssemblyType::Unknown);
            for capability in extensions.discoverers_for(Path::new(source), source_type) {
                if !options.executor_uris.contains(&capability.default_executor_uri) {
                    options
                        .executor_uris
                        .push(capability.default_executor_uri.clone());
                }
            }
        }
        (host_manager, options)
    }
}

/// The most common classified type; ties go to the fallback type. Sources
/// that were not classified do not vote.
pub fn dominant_assembly_type(types: &HashMap<String, AssemblyType>) -> AssemblyType {
    let mut native = 0usize;
    let mut managed = 0usize;
    for assembly_type in types.values() {
        match assembly_type {
            AssemblyType::Native => native += 1,
            AssemblyType::Managed => managed += 1,
            AssemblyType::Unknown => {}
        }
    }
    if native == 0 && managed == 0 {
        return AssemblyType::Unknown;
    }
    match native.cmp(&managed) {
        std::cmp::Ordering::Greater => AssemblyType::Native,
        std::cmp::Ordering::Less => AssemblyType::Managed,
        std::cmp::Ordering::Equal => FALLBACK_ASSEMBLY_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::pe::fixture;
    use crate::extensions::CapabilityDeclaration;
    use crate::host::HostManagerSelector;
    use crate::request::RequestState;
    use crate::settings::Architecture;
    use crate::transport::ConnectionRole;
    use std::fs;

    fn named(name: &'static str) -> HostManagerFactory {
        Arc::new(move || Box::new(DefaultTestHostManager::new("testhost").with_name(name)))
    }

    #[test]
    fn empty_criteria_is_rejected() {
        let platform = TestPlatform::new(ProctorConfig::default());
        assert!(matches!(
            platform.create_discovery_request(DiscoveryCriteria::new(Vec::<String>::new(), "")),
            Err(PlatformError::InvalidArgument(_))
        ));
        assert!(matches!(
            platform.create_run_request(RunCriteria::from_sources(Vec::<String>::new(), "")),
            Err(PlatformError::InvalidArgument(_))
        ));
    }

    #[test]
    fn malformed_run_settings_are_rejected() {
        let platform = TestPlatform::new(ProctorConfig::default());
        let criteria = DiscoveryCriteria::new(["a.dll"], "[run_configuration");
        assert!(matches!(
            platform.create_discovery_request(criteria),
            Err(PlatformError::Settings(_))
        ));
    }

    #[test]
    fn requests_are_returned_created() {
        let platform = TestPlatform::new(ProctorConfig::default());
        let discovery = platform
            .create_discovery_request(DiscoveryCriteria::new(["a.dll"], ""))
            .expect("discovery");
        assert_eq!(discovery.state(), RequestState::Created);
        let run = platform
            .create_run_request(RunCriteria::from_sources(["a.dll"], ""))
            .expect("run");
        assert_eq!(run.state(), RequestState::Created);
        drop(discovery);
        drop(run);
    }

    #[test]
    fn dominant_type_counts_classified_sources() {
        let mut types = HashMap::new();
        assert_eq!(dominant_assembly_type(&types), AssemblyType::Unknown);
        types.insert("a.dll".to_string(), AssemblyType::Native);
        assert_eq!(dominant_assembly_type(&types), AssemblyType::Native);
        types.insert("b.dll".to_string(), AssemblyType::Managed);
        assert_eq!(dominant_assembly_type(&types), FALLBACK_ASSEMBLY_TYPE);
        types.insert("c.dll".to_string(), AssemblyType::Managed);
        assert_eq!(dominant_assembly_type(&types), AssemblyType::Managed);
    }

    #[test]
    fn native_sources_resolve_the_native_manager() {
        let dir = tempfile::tempdir().expect("tempdir");
        let native = dir.path().join("native.dll");
        fs::write(&native, fixture::image(false)).expect("write");
        let source = native.display().to_string();

        let mut registry = HostManagerRegistry::new(named("fallback"));
        registry.register(
            HostManagerSelector::default().assembly_type(AssemblyType::Native),
            named("native"),
        );
        let platform = TestPlatform::with_registry(ProctorConfig::default(), registry);
        let (manager, _) = platform.prepare(std::slice::from_ref(&source), &RunConfiguration::default());
        assert_eq!(manager.name(), "native");

        let config = RunConfiguration {
            target_platform: Architecture::Arm64,
            connection_role: Some(ConnectionRole::Client),
            ..RunConfiguration::default()
        };
        let (manager, options) = platform.prepare(&["tests.js".to_string()], &config);
        assert_eq!(manager.name(), "fallback");
        assert_eq!(options.role, ConnectionRole::Client);
    }

    #[test]
    fn options_carry_extensions_and_executors() {
        let platform = TestPlatform::new(ProctorConfig::default());
        platform.initialize_extensions(["/ext/a.dll"], false);
        platform.update_extensions(["/ext/a.dll", "/ext/b.dll"], false);
        platform.register_discoverer(DiscovererCapability::from_declaration(&CapabilityDeclaration {
            name: "js",
            default_executor_uri: "executor://js",
            file_extensions: &[".js"],
            assembly_type: None,
        }));

        let (_, options) = platform.prepare(
            &["one.js".to_string(), "two.js".to_string()],
            &RunConfiguration::default(),
        );
        assert_eq!(
            options.extensions,
            vec![PathBuf::from("/ext/a.dll"), PathBuf::from("/ext/b.dll")]
        );
        assert_eq!(options.executor_uris, vec!["executor://js".to_string()]);
    }
}
