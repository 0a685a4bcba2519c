// Language profile table
// Static per-language staging and execution settings, loaded once at start.

use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholders a command template may reference.
pub const PLACEHOLDERS: [&str; 4] = ["source", "binary", "dir", "entry"];

#[derive(Debug, Error)]
pub enum LanguageTableError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Language '{0}' is configured more than once")]
    Duplicate(Language),

    #[error("No languages configured")]
    Empty,

    #[error("Language '{language}': {problem}")]
    Invalid { language: Language, problem: String },

    #[error("Language '{0}' is not configured")]
    NotConfigured(Language),
}

/// Values substituted into command templates for one job.
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub source: &'a str,
    pub binary: &'a str,
    pub dir: &'a str,
    pub entry: &'a str,
}

impl<'a> TemplateVars<'a> {
    fn lookup(&self, name: &str) -> Option<&'a str> {
        match name {
            "source" => Some(self.source),
            "binary" => Some(self.binary),
            "dir" => Some(self.dir),
            "entry" => Some(self.entry),
            _ => None,
        }
    }
}

/// An argv template such as `["gcc", "-o", "{binary}", "{source}"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Placeholder names referenced anywhere in the template.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for part in &self.0 {
            let mut rest = part.as_str();
            while let Some(open) = rest.find('{') {
                let after = &rest[open + 1..];
                match after.find('}') {
                    Some(close) => {
                        names.push(after[..close].to_string());
                        rest = &after[close + 1..];
                    }
                    None => break,
                }
            }
        }
        names
    }

    pub fn references(&self, name: &str) -> bool {
        self.placeholders().iter().any(|p| p == name)
    }

    /// Substitute every `{name}` with its value. Unknown names are an error.
    pub fn render(&self, vars: &TemplateVars<'_>) -> Result<Vec<String>, String> {
        self.0
            .iter()
            .map(|part| {
                let mut out = String::with_capacity(part.len());
                let mut rest = part.as_str();
                while let Some(open) = rest.find('{') {
                    out.push_str(&rest[..open]);
                    let after = &rest[open + 1..];
                    let close = after
                        .find('}')
                        .ok_or_else(|| format!("unterminated placeholder in '{}'", part))?;
                    let name = &after[..close];
                    let value = vars
                        .lookup(name)
                        .ok_or_else(|| format!("unknown placeholder '{{{}}}'", name))?;
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                out.push_str(rest);
                Ok(out)
            })
            .collect()
    }
}

/// Static configuration for one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub name: Language,
    #[serde(default = "default_version")]
    pub version: String,
    pub file_extension: String,
    /// Fixed source file name; otherwise one is derived from the job id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Class the entry point is normalized to (Java).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f32>,
}

fn default_version() -> String {
    "latest".to_string()
}

impl LanguageProfile {
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Structural checks run when the table is built.
    pub fn validate(&self) -> Result<(), LanguageTableError> {
        let invalid = |problem: String| LanguageTableError::Invalid {
            language: self.name,
            problem,
        };

        if !self.file_extension.starts_with('.') || self.file_extension.len() < 2 {
            return Err(invalid(format!(
                "file extension '{}' must look like '.ext'",
                self.file_extension
            )));
        }
        if self.run.0.is_empty() {
            return Err(invalid("run command is empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("sandbox image is empty".to_string()));
        }

        let templates = std::iter::once(&self.run).chain(self.compile.iter());
        for template in templates {
            for name in template.placeholders() {
                if !PLACEHOLDERS.contains(&name.as_str()) {
                    return Err(invalid(format!("unknown placeholder '{{{}}}'", name)));
                }
            }
        }

        if let Some(compile) = &self.compile {
            if compile.0.is_empty() {
                return Err(invalid("compile command is empty".to_string()));
            }
            let produces_binary = compile.references("binary");
            let runs_binary = self.run.references("binary");
            if produces_binary != runs_binary {
                return Err(invalid(
                    "compile and run commands disagree on {binary}".to_string(),
                ));
            }
        }

        if self.entry_class.is_some() && self.source_name.is_none() {
            return Err(invalid(
                "entry_class requires a fixed source_name".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LanguagesFile {
    languages: Vec<LanguageProfile>,
}

/// Read-only registry of language profiles.
#[derive(Debug, Clone)]
pub struct LanguageTable {
    profiles: BTreeMap<Language, LanguageProfile>,
}

impl LanguageTable {
    pub fn from_profiles(profiles: Vec<LanguageProfile>) -> Result<Self, LanguageTableError> {
        if profiles.is_empty() {
            return Err(LanguageTableError::Empty);
        }

        let mut map = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            let name = profile.name;
            if map.insert(name, profile).is_some() {
                return Err(LanguageTableError::Duplicate(name));
            }
        }

        Ok(Self { profiles: map })
    }

    /// Load profiles from a `languages.json` file.
    pub fn load(path: &Path) -> Result<Self, LanguageTableError> {
        let content = fs::read_to_string(path).map_err(|source| LanguageTableError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let file: LanguagesFile =
            serde_json::from_str(&content).map_err(|source| LanguageTableError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::from_profiles(file.languages)
    }

    /// Load from `path` when it exists, otherwise fall back to the built-in table.
    pub fn load_or_builtin(path: &Path) -> Result<Self, LanguageTableError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Language file not found, using built-in profiles");
            Ok(Self::builtin())
        }
    }

    /// Keep only the listed languages. An empty list keeps everything.
    pub fn restrict_to(self, enabled: &[Language]) -> Result<Self, LanguageTableError> {
        if enabled.is_empty() {
            return Ok(self);
        }
        for language in enabled {
            if !self.profiles.contains_key(language) {
                return Err(LanguageTableError::NotConfigured(*language));
            }
        }
        let profiles = self
            .profiles
            .into_iter()
            .filter(|(language, _)| enabled.contains(language))
            .collect();
        Ok(Self { profiles })
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    pub fn is_enabled(&self, language: Language) -> bool {
        self.profiles.contains_key(&language)
    }

    pub fn languages(&self) -> Vec<Language> {
        self.profiles.keys().copied().collect()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        let file = LanguagesFile {
            languages: self.profiles.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&file)
    }

    /// Built-in profiles matching the images shipped with the engine.
    pub fn builtin() -> Self {
        let profiles = vec![
            LanguageProfile {
                name: Language::Python,
                version: "3.11".to_string(),
                file_extension: ".py".to_string(),
                source_name: None,
                entry_class: None,
                compile: None,
                run: CommandTemplate::new(["python3", "-u", "{source}"]),
                image: "arena-python:latest".to_string(),
                memory_limit_mb: None,
                cpu_limit: None,
            },
            LanguageProfile {
                name: Language::JavaScript,
                version: "20".to_string(),
                file_extension: ".js".to_string(),
                source_name: None,
                entry_class: None,
                compile: None,
                run: CommandTemplate::new(["node", "{source}"]),
                image: "arena-javascript:latest".to_string(),
                memory_limit_mb: None,
                cpu_limit: None,
            },
            LanguageProfile {
                name: Language::TypeScript,
                version: "5".to_string(),
                file_extension: ".ts".to_string(),
                source_name: None,
                entry_class: None,
                compile: None,
                run: CommandTemplate::new(["ts-node", "--transpile-only", "{source}"]),
                image: "arena-javascript:latest".to_string(),
                memory_limit_mb: Some(256),
                cpu_limit: None,
            },
            LanguageProfile {
                name: Language::Java,
                version: "17".to_string(),
                file_extension: ".java".to_string(),
                source_name: Some("Solution.java".to_string()),
                entry_class: Some("Solution".to_string()),
                compile: Some(CommandTemplate::new(["javac", "-d", "{dir}", "{source}"])),
                run: CommandTemplate::new([
                    "java",
                    "-XX:+UseSerialGC",
                    "-Xss16m",
                    "-cp",
                    "{dir}",
                    "{entry}",
                ]),
                image: "arena-java:latest".to_string(),
                memory_limit_mb: Some(256),
                cpu_limit: None,
            },
            LanguageProfile {
                name: Language::Cpp,
                version: "17".to_string(),
                file_extension: ".cpp".to_string(),
                source_name: None,
                entry_class: None,
                compile: Some(CommandTemplate::new([
                    "g++",
                    "-std=c++17",
                    "-O2",
                    "-o",
                    "{binary}",
                    "{source}",
                ])),
                run: CommandTemplate::new(["{binary}"]),
                image: "arena-cpp:latest".to_string(),
                memory_limit_mb: None,
                cpu_limit: None,
            },
            LanguageProfile {
                name: Language::C,
                version: "11".to_string(),
                file_extension: ".c".to_string(),
                source_name: None,
                entry_class: None,
                compile: Some(CommandTemplate::new([
                    "gcc",
                    "-std=c11",
                    "-O2",
                    "-o",
                    "{binary}",
                    "{source}",
                    "-lm",
                ])),
                run: CommandTemplate::new(["{binary}"]),
                image: "arena-c:latest".to_string(),
                memory_limit_mb: None,
                cpu_limit: None,
            },
        ];

        Self {
            profiles: profiles.into_iter().map(|p| (p.name, p)).collect(),
        }
    }
}
