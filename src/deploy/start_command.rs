//! Start command for remote instances.
//!
//! The platform executes the start command without a shell, so identity
//! files (IDENTITY.md, SOUL.md) are written by an explicit `/bin/sh -c`
//! wrapper that reads them from the environment and then execs the runtime.

use crate::compiler::{AGENT_NAME_VAR, SYSTEM_PROMPT_VAR};

#[derive(Debug, Clone)]
pub struct StartCommand<'a> {
    entrypoint: &'a str,
    workspace: &'a str,
    agent_name: bool,
    system_prompt: bool,
}

impl<'a> StartCommand<'a> {
    pub fn new(entrypoint: &'a str, workspace: &'a str) -> Self {
        Self {
            entrypoint,
            workspace,
            agent_name: false,
            system_prompt: false,
        }
    }

    /// Whether `$AGENT_NAME` will be set on the instance.
    pub fn with_agent_name(mut self, present: bool) -> Self {
        self.agent_name = present;
        self
    }

    /// Whether `$AGENT_SYSTEM_PROMPT` will be set on the instance.
    pub fn with_system_prompt(mut self, present: bool) -> Self {
        self.system_prompt = present;
        self
    }

    /// The shell script run inside the wrapper.
    pub fn script(&self) -> String {
        let workspace = self.workspace.trim_end_matches('/');
        let mut steps = Vec::new();

        if self.agent_name || self.system_prompt {
            steps.push(format!("mkdir -p {}", shell_quote(workspace)));
        }
        if self.agent_name {
            steps.push(format!(
                "printf '%s\\n' \"${AGENT_NAME_VAR}\" > {}",
                shell_quote(&format!("{workspace}/IDENTITY.md"))
            ));
        }
        if self.agent_name || self.system_prompt {
            let mut parts = Vec::new();
            if self.agent_name {
                parts.push(format!("printf '# %s\\n\\n' \"${AGENT_NAME_VAR}\""));
            }
            if self.system_prompt {
                parts.push(format!("printf '%s\\n' \"${SYSTEM_PROMPT_VAR}\""));
            }
            steps.push(format!(
                "{{ {}; }} > {}",
                parts.join("; "),
                shell_quote(&format!("{workspace}/SOUL.md"))
            ));
        }

        steps.push(format!("exec {}", self.entrypoint.trim()));
        steps.join(" && ")
    }

    /// `/bin/sh -c '<script>'`, ready for the platform's start command field.
    pub fn build(&self) -> String {
        format!("/bin/sh -c {}", shell_quote(&self.script()))
    }
}

/// Every file [`identity_documents`] can produce.
pub const IDENTITY_FILES: [&str; 2] = ["IDENTITY.md", "SOUL.md"];

/// The identity files the start command would write, rendered directly.
/// Used by backends with host access to the workspace.
pub fn identity_documents(
    agent_name: Option<&str>,
    system_prompt: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut documents = Vec::new();
    if let Some(name) = agent_name {
        documents.push(("IDENTITY.md", format!("{name}\n")));
    }
    if agent_name.is_some() || system_prompt.is_some() {
        let mut soul = String::new();
        if let Some(name) = agent_name {
            soul.push_str(&format!("# {name}\n\n"));
        }
        if let Some(prompt) = system_prompt {
            soul.push_str(prompt);
            soul.push('\n');
        }
        documents.push(("SOUL.md", soul));
    }
    documents
}

/// POSIX single-quote a value.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
