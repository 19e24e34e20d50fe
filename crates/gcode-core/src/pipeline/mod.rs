//! Language pipelines: what to compile, what to run, and with which arguments.
//!
//! A pipeline is pure data. Adding a language means adding an entry to the
//! registry, never a new branch in the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub mod registry;

pub use registry::PipelineRegistry;

/// The process stage an execution was in when it settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Run => write!(f, "run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Bash,
    C,
    Cpp,
    Rust,
    Java,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Python,
        Language::JavaScript,
        Language::Bash,
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Java,
    ];

    /// Resolve a user-supplied identifier, accepting the common aliases.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Some(Language::JavaScript),
            "bash" | "sh" | "shell" => Some(Language::Bash),
            "c" => Some(Language::C),
            "cpp" | "c++" | "cxx" => Some(Language::Cpp),
            "rust" | "rs" => Some(Language::Rust),
            "java" => Some(Language::Java),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Rust => "rust",
            Language::Java => "java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Interpreted,
    Compiled,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Interpreted => f.pad("interpreted"),
            PipelineKind::Compiled => f.pad("compiled"),
        }
    }
}

/// A program plus argument template.
///
/// `program` and each argument may reference `{source}`, `{artifact}`,
/// `{workdir}` and `{entry}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render(&self, paths: &TemplatePaths<'_>) -> (String, Vec<String>) {
        let program = paths.substitute(&self.program);
        let args = self.args.iter().map(|a| paths.substitute(a)).collect();
        (program, args)
    }
}

/// Concrete values for the placeholders of a `CommandTemplate`.
pub struct TemplatePaths<'a> {
    pub source: &'a Path,
    pub artifact: Option<&'a Path>,
    pub workdir: &'a Path,
    pub entry: &'a str,
}

impl TemplatePaths<'_> {
    fn substitute(&self, template: &str) -> String {
        let mut rendered = template
            .replace("{source}", &self.source.to_string_lossy())
            .replace("{workdir}", &self.workdir.to_string_lossy())
            .replace("{entry}", self.entry);
        if let Some(artifact) = self.artifact {
            rendered = rendered.replace("{artifact}", &artifact.to_string_lossy());
        }
        rendered
    }
}

/// Declarative description of how one language is built and executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub language: Language,
    pub source_ext: String,
    /// File stem of the source file. Some toolchains tie this to the entry type.
    pub entry_stem: String,
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// Name of the compile output inside the workspace directory.
    pub artifact: Option<String>,
}

impl PipelineSpec {
    pub fn interpreted(language: Language, source_ext: &str, run: CommandTemplate) -> Self {
        Self {
            language,
            source_ext: source_ext.to_string(),
            entry_stem: "main".to_string(),
            compile: None,
            run,
            artifact: None,
        }
    }

    pub fn compiled(
        language: Language,
        source_ext: &str,
        compile: CommandTemplate,
        run: CommandTemplate,
    ) -> Self {
        Self {
            language,
            source_ext: source_ext.to_string(),
            entry_stem: "main".to_string(),
            compile: Some(compile),
            run,
            artifact: Some(format!("main{}", std::env::consts::EXE_SUFFIX)),
        }
    }

    pub fn with_entry_stem(mut self, stem: &str) -> Self {
        self.entry_stem = stem.to_string();
        self
    }

    pub fn with_artifact(mut self, artifact: &str) -> Self {
        self.artifact = Some(artifact.to_string());
        self
    }

    pub fn kind(&self) -> PipelineKind {
        if self.compile.is_some() {
            PipelineKind::Compiled
        } else {
            PipelineKind::Interpreted
        }
    }

    pub fn source_file_name(&self) -> String {
        format!("{}.{}", self.entry_stem, self.source_ext)
    }

    /// Constraints the submitted code must satisfy for this pipeline to work.
    pub fn requirements(&self) -> Option<String> {
        match self.language {
            Language::Java => Some(format!(
                "The public class must be named `{}` (the source is saved as {}).",
                self.entry_stem,
                self.source_file_name()
            )),
            _ => None,
        }
    }

    /// Programs that must be resolvable on PATH for this pipeline to run.
    pub fn required_programs(&self) -> Vec<&str> {
        let mut programs = Vec::new();
        if let Some(compile) = &self.compile {
            programs.push(compile.program.as_str());
        }
        // A run program that is the artifact itself is produced by the compile stage.
        if !self.run.program.contains('{') {
            programs.push(self.run.program.as_str());
        }
        programs
    }
}
