use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::TestHostManager;
use crate::classify::AssemblyType;
use crate::settings::Architecture;

pub type HostManagerFactory = Arc<dyn Fn() -> Box<dyn TestHostManager> + Send + Sync>;

/// Which sessions a registered host manager serves. `None` fields match
/// anything; every `Some` field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostManagerSelector {
    pub platform: Option<Architecture>,
    pub framework: Option<String>,
    pub assembly_type: Option<AssemblyType>,
}

impl HostManagerSelector {
    pub fn platform(mut self, platform: Architecture) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn assembly_type(mut self, assembly_type: AssemblyType) -> Self {
        self.assembly_type = Some(assembly_type);
        self
    }

    /// Number of constrained fields when every constraint holds.
    fn specificity(
        &self,
        platform: Architecture,
        framework: Option<&str>,
        assembly_type: AssemblyType,
    ) -> Option<usize> {
        let mut score = 0;
        if let Some(expected) = self.platform {
            if expected != platform {
                return None;
            }
            score += 1;
        }
        if let Some(expected) = &self.framework {
            if !framework.is_some_and(|actual| actual.eq_ignore_ascii_case(expected)) {
                return None;
            }
            score += 1;
        }
        if let Some(expected) = self.assembly_type {
            if expected != assembly_type {
                return None;
            }
            score += 1;
        }
        Some(score)
    }
}

pub struct HostManagerRegistry {
    entries: Vec<(HostManagerSelector, HostManagerFactory)>,
    fallback: HostManagerFactory,
}

impl HostManagerRegistry {
    pub fn new(fallback: HostManagerFactory) -> Self {
        Self {
            entries: Vec::new(),
            fallback,
        }
    }

    pub fn register(&mut self, selector: HostManagerSelector, factory: HostManagerFactory) {
        self.entries.push((selector, factory));
    }

    /// Builds a fresh manager for one session: the most specific matching
    /// registration wins (earliest on ties), the fallback otherwise.
    pub fn resolve(
        &self,
        platform: Architecture,
        framework: Option<&str>,
        assembly_type: AssemblyType,
    ) -> Box<dyn TestHostManager> {
        let best = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, (selector, factory))| {
                selector
                    .specificity(platform, framework, assembly_type)
                    .map(|score| (score, index, factory))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        match best {
            Some((score, index, factory)) => {
                debug!(%platform, ?framework, ?assembly_type, index, score, "resolved registered host manager");
                factory()
            }
            None => {
                debug!(%platform, ?framework, ?assembly_type, "using fallback host manager");
                (self.fallback)()
            }
        }
    }
}

impl fmt::Debug for HostManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostManagerRegistry")
            .field(
                "selectors",
                &self.entries.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
