//! Prompt sections produced by the enrichment steps.
//!
//! Everything here is plain text assembly. The synchronizer decides which
//! sections apply and isolates the failures of whatever fetched their input.

use crate::desired::{DelegationTarget, NamedVariable, RosterAgent};

/// System prompt under construction: enrichment text is either prepended or
/// appended around the user's own prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    prefix: Vec<String>,
    base: Option<String>,
    suffix: Vec<String>,
}

impl PromptBuilder {
    pub fn new(base: Option<&str>) -> Self {
        Self {
            base: base
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
            ..Default::default()
        }
    }

    pub fn prepend(&mut self, section: String) {
        self.prefix.push(section);
    }

    pub fn append(&mut self, section: String) {
        self.suffix.push(section);
    }

    /// `None` when there is neither a base prompt nor any section.
    pub fn build(self) -> Option<String> {
        let sections: Vec<String> = self
            .prefix
            .into_iter()
            .chain(self.base)
            .chain(self.suffix)
            .collect();
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

pub fn memory_context(digest: &str) -> String {
    format!("## What you remember about this user\n\n{}", digest.trim())
}

pub fn memory_write_instructions(instructions: &str) -> String {
    format!("## Saving memories\n\n{}", instructions.trim())
}

/// Instructions for delegating to linked instances over their gateways.
/// Targets without a reachable URL are left out.
pub fn delegation_instructions(targets: &[DelegationTarget]) -> Option<String> {
    let reachable: Vec<&DelegationTarget> = targets
        .iter()
        .filter(|target| target.url.is_some())
        .collect();
    if reachable.is_empty() {
        return None;
    }

    let mut text = String::from(
        "## Delegating to other agents\n\n\
         You can hand tasks to the agents below. Send the task as a chat \
         completion request to the agent's URL with the header \
         `Authorization: Bearer <token>` and relay the answer.\n",
    );
    for target in reachable {
        let url = target.url.as_deref().unwrap_or_default();
        text.push_str(&format!(
            "\n- {} ({}): {}/v1/chat/completions, token `{}`",
            target.name,
            target.role,
            url.trim_end_matches('/'),
            target.token
        ));
    }
    Some(text)
}

/// Instructions for the native multi-agent roster.
pub fn orchestration_instructions(roster: &[RosterAgent]) -> Option<String> {
    if roster.is_empty() {
        return None;
    }

    let mut text = String::from(
        "## Your team\n\n\
         You coordinate the agents below. Route each request to the agent \
         whose role fits it best and answer directly when none does.\n",
    );
    for agent in roster {
        if agent.role.trim().is_empty() {
            text.push_str(&format!("\n- {} (id `{}`)", agent.name, agent.id));
        } else {
            text.push_str(&format!(
                "\n- {} (id `{}`): {}",
                agent.name,
                agent.id,
                agent.role.trim()
            ));
        }
    }
    Some(text)
}

/// Lookup instructions for named variables. Only names are listed; values
/// are fetched at runtime with the instance's gateway token.
pub fn variable_instructions(
    variables: &[NamedVariable],
    callback_base: &str,
    user_id: &str,
) -> Option<String> {
    if variables.is_empty() {
        return None;
    }

    let base = callback_base.trim_end_matches('/');
    let mut text = format!(
        "## Stored variables\n\n\
         The user stored the secrets below. Never print their values. Fetch \
         one when a task needs it with `GET {base}/users/{user_id}/variables/<NAME>` \
         and the header `Authorization: Bearer $GATEWAY_TOKEN`.\n"
    );
    for variable in variables {
        text.push_str(&format!("\n- {}", variable.name));
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_orders_prefix_base_suffix() {
        let mut prompt = PromptBuilder::new(Some("  Be brief.  "));
        prompt.append("after".into());
        prompt.prepend("before".into());
        assert_eq!(prompt.build().as_deref(), Some("before\n\nBe brief.\n\nafter"));

        assert_eq!(PromptBuilder::new(Some("   ")).build(), None);
        let mut only_section = PromptBuilder::new(None);
        only_section.append("x".into());
        assert_eq!(only_section.build().as_deref(), Some("x"));
    }

    #[test]
    fn delegation_skips_targets_without_url() {
        let targets = vec![
            DelegationTarget {
                instance_id: "a".into(),
                name: "Scout".into(),
                role: "research".into(),
                url: Some("http://scout.internal:18789/".into()),
                token: "tok-a".into(),
            },
            DelegationTarget {
                instance_id: "b".into(),
                name: "Ghost".into(),
                role: "none".into(),
                url: None,
                token: "tok-b".into(),
            },
        ];
        let text = delegation_instructions(&targets).expect("one reachable target");
        assert!(text.contains("Scout (research): http://scout.internal:18789/v1/chat/completions"));
        assert!(text.contains("tok-a"));
        assert!(!text.contains("Ghost"));

        assert!(delegation_instructions(&targets[1..]).is_none());
    }

    #[test]
    fn variables_list_names_but_never_values() {
        let variables = vec![NamedVariable {
            name: "GITHUB_TOKEN".into(),
            value: "ghp_secret".into(),
        }];
        let text = variable_instructions(&variables, "https://berth.example/api/", "alice")
            .expect("section");
        assert!(text.contains("- GITHUB_TOKEN"));
        assert!(text.contains("https://berth.example/api/users/alice/variables/<NAME>"));
        assert!(!text.contains("ghp_secret"));
        assert!(variable_instructions(&[], "x", "y").is_none());
    }

    #[test]
    fn roster_lists_every_agent() {
        let roster = vec![
            RosterAgent {
                id: "main".into(),
                name: "Lead".into(),
                ..Default::default()
            },
            RosterAgent {
                id: "code".into(),
                name: "Coder".into(),
                role: "writes code".into(),
                ..Default::default()
            },
        ];
        let text = orchestration_instructions(&roster).expect("section");
        assert!(text.contains("- Lead (id `main`)\n"));
        assert!(text.ends_with("- Coder (id `code`): writes code"));
    }
}
