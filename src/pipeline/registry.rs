//! Named pipelines and their registry.

use std::sync::{Arc, RwLock};

use crate::phase::{
    AnalysisPhase, DevelopmentPhase, FixerPhase, JudgePhase, PhaseRole, PhaseSpec,
};

/// A named, ordered sequence of phases. Immutable once registered.
pub struct Pipeline {
    name: String,
    description: String,
    phases: Vec<Arc<dyn PhaseSpec>>,
}

impl Pipeline {
    pub fn new(name: &str, description: &str, phases: Vec<Arc<dyn PhaseSpec>>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            phases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn phases(&self) -> &[Arc<dyn PhaseSpec>] {
        &self.phases
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name().to_string()).collect()
    }

    /// First phase with the given role, if any.
    pub fn find_role(&self, role: PhaseRole) -> Option<&Arc<dyn PhaseSpec>> {
        self.phases.iter().find(|p| p.role() == role)
    }

    pub fn has_role(&self, role: PhaseRole) -> bool {
        self.find_role(role).is_some()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("phases", &self.phase_names())
            .finish()
    }
}

/// Registry of pipelines, keyed by name.
///
/// Registration order is preserved for enumeration (capabilities
/// endpoints list pipelines in the order they were registered);
/// re-registering a name overwrites in place — last writer wins, no
/// versioning.
#[derive(Default)]
pub struct PipelineRegistry {
    inner: RwLock<Vec<Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pipeline: Pipeline) {
        let pipeline = Arc::new(pipeline);
        let mut inner = self.inner.write().expect("pipeline registry poisoned");
        match inner.iter_mut().find(|p| p.name() == pipeline.name()) {
            Some(slot) => *slot = pipeline,
            None => inner.push(pipeline),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.inner
            .read()
            .expect("pipeline registry poisoned")
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// All pipelines in registration order.
    pub fn list_all(&self) -> Vec<Arc<Pipeline>> {
        self.inner
            .read()
            .expect("pipeline registry poisoned")
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.list_all().iter().map(|p| p.name().to_string()).collect()
    }
}

/// Registry pre-populated with the built-in pipelines.
pub fn default_registry() -> PipelineRegistry {
    let registry = PipelineRegistry::new();
    registry.register(Pipeline::new(
        "feature_development",
        "Analyze into stories, develop, review, and fix each one",
        vec![
            Arc::new(AnalysisPhase),
            Arc::new(DevelopmentPhase),
            Arc::new(JudgePhase),
            Arc::new(FixerPhase),
        ],
    ));
    registry.register(Pipeline::new(
        "quick_fix",
        "Develop and review without story decomposition",
        vec![Arc::new(DevelopmentPhase), Arc::new(JudgePhase)],
    ));
    registry
}
