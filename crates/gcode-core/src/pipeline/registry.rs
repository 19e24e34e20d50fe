use std::collections::HashMap;

use super::{CommandTemplate, Language, PipelineSpec};
use crate::config::types::LanguageOverride;
use crate::errors::ConfigError;

/// Read-only table of the pipelines this process can execute.
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it per request.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<Language, PipelineSpec>,
}

impl PipelineRegistry {
    pub fn empty() -> Self {
        Self {
            pipelines: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with_pipeline(PipelineSpec::interpreted(
                Language::Python,
                "py",
                CommandTemplate::new("python3", &["{source}"]),
            ))
            .with_pipeline(PipelineSpec::interpreted(
                Language::JavaScript,
                "js",
                CommandTemplate::new("node", &["{source}"]),
            ))
            .with_pipeline(PipelineSpec::interpreted(
                Language::Bash,
                "sh",
                CommandTemplate::new("bash", &["{source}"]),
            ))
            .with_pipeline(PipelineSpec::compiled(
                Language::C,
                "c",
                CommandTemplate::new("gcc", &["{source}", "-o", "{artifact}"]),
                CommandTemplate::new("{artifact}", &[]),
            ))
            .with_pipeline(PipelineSpec::compiled(
                Language::Cpp,
                "cpp",
                CommandTemplate::new("g++", &["-std=c++17", "{source}", "-o", "{artifact}"]),
                CommandTemplate::new("{artifact}", &[]),
            ))
            .with_pipeline(PipelineSpec::compiled(
                Language::Rust,
                "rs",
                CommandTemplate::new(
                    "rustc",
                    &["--edition", "2021", "-O", "{source}", "-o", "{artifact}"],
                ),
                CommandTemplate::new("{artifact}", &[]),
            ))
            .with_pipeline(
                PipelineSpec::compiled(
                    Language::Java,
                    "java",
                    CommandTemplate::new("javac", &["-d", "{workdir}", "{source}"]),
                    CommandTemplate::new("java", &["-cp", "{workdir}", "{entry}"]),
                )
                .with_entry_stem("Main")
                .with_artifact("Main.class"),
            )
    }

    /// Built-in pipelines with the configured per-language overrides applied.
    pub fn from_overrides(overrides: &HashMap<String, LanguageOverride>) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin();

        for (id, language_override) in overrides {
            let language = Language::from_id(id).ok_or_else(|| {
                ConfigError::Invalid(format!("Unknown language '{}' in languages section", id))
            })?;

            if !language_override.enabled {
                log::info!("Language '{}' disabled by configuration", language);
                registry.pipelines.remove(&language);
                continue;
            }

            let Some(spec) = registry.pipelines.get_mut(&language) else {
                continue;
            };

            if let Some(compile) = &language_override.compile {
                if spec.compile.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "Language '{}' is interpreted and cannot take a compile command",
                        language
                    )));
                }
                spec.compile = Some(compile.clone());
            }
            if let Some(run) = &language_override.run {
                spec.run = run.clone();
            }
            log::debug!("Applied pipeline override for '{}': {:?}", language, spec);
        }

        Ok(registry)
    }

    pub fn with_pipeline(mut self, spec: PipelineSpec) -> Self {
        self.pipelines.insert(spec.language, spec);
        self
    }

    /// Resolve a user-supplied language identifier. `None` means unsupported.
    pub fn lookup(&self, language_id: &str) -> Option<&PipelineSpec> {
        Language::from_id(language_id).and_then(|language| self.get(language))
    }

    pub fn get(&self, language: Language) -> Option<&PipelineSpec> {
        self.pipelines.get(&language)
    }

    /// All registered pipelines in a stable order.
    pub fn pipelines(&self) -> Vec<&PipelineSpec> {
        let mut pipelines: Vec<_> = self.pipelines.values().collect();
        pipelines.sort_by_key(|spec| spec.language);
        pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Whether every program the pipeline needs resolves on PATH.
    pub fn toolchain_available(spec: &PipelineSpec) -> bool {
        spec.required_programs()
            .iter()
            .all(|program| which::which(program).is_ok())
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
