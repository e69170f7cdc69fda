//! System prompts for the root and sub-agents

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// What a prompt is being built for
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub is_root: bool,
    pub is_source_available: bool,
    pub skills: &'a [String],
    pub max_agents: usize,
}

/// Skill/prompt collaborator: supplies system-prompt text for an agent
pub trait PromptSource: Send + Sync {
    fn system_prompt(&self, ctx: &PromptContext<'_>) -> String;
}

/// Agent prompt configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentPrompt {
    pub prompt: String,
}

/// Prompts loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct StaticPrompts {
    pub root: AgentPrompt,
    pub subagent: AgentPrompt,
    pub source_available: AgentPrompt,
    #[serde(default)]
    pub skills: HashMap<String, AgentPrompt>,
}

impl StaticPrompts {
    /// Load prompts from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse prompts from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse prompts: {}", e)))
    }

    /// Load from default location (embedded)
    #[allow(clippy::expect_used)]
    pub fn default_prompts() -> Self {
        let content = include_str!("../../prompts.toml");
        Self::parse(content).expect("Embedded prompts.toml should be valid")
    }

    pub fn skill(&self, name: &str) -> Option<&str> {
        self.skills.get(name).map(|p| p.prompt.as_str())
    }
}

impl Default for StaticPrompts {
    fn default() -> Self {
        Self::default_prompts()
    }
}

impl PromptSource for StaticPrompts {
    fn system_prompt(&self, ctx: &PromptContext<'_>) -> String {
        let base = if ctx.is_root {
            &self.root.prompt
        } else {
            &self.subagent.prompt
        };
        let mut out = base
            .trim()
            .replace("{max_agents}", &ctx.max_agents.to_string());

        if ctx.is_source_available {
            out.push_str("\n\n");
            out.push_str(self.source_available.prompt.trim());
        }

        let mut loaded = Vec::new();
        for skill in ctx.skills {
            match self.skill(skill) {
                Some(text) => loaded.push(format!("<skill name=\"{skill}\">\n{}\n</skill>", text.trim())),
                None => debug!(skill = %skill, "No prompt text for skill"),
            }
        }
        if !loaded.is_empty() {
            out.push_str("\n\n<skills>\n");
            out.push_str(&loaded.join("\n"));
            out.push_str("\n</skills>");
        }
        out
    }
}
