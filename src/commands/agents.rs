//! Agent listing and name resolution

use anyhow::{bail, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::Serialize;
use tabled::Tabled;

use crate::backend::{is_reasoning_model, model_display_name, DEFAULT_REASONING_EFFORT};
use crate::config::{AgentConfig, AgentKind, RuntimeContext};
use crate::output::print_table;

#[derive(Debug, Clone, Serialize, Tabled)]
struct AgentRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ENTITY")]
    entity_id: String,
    #[tabled(rename = "KIND")]
    kind: &'static str,
    #[tabled(rename = "MODEL")]
    model: String,
    #[tabled(rename = "CONTROL")]
    control: bool,
    #[tabled(rename = "WEB SEARCH")]
    web_search: bool,
    #[tabled(rename = "REASONING")]
    reasoning_effort: String,
}

impl From<&AgentConfig> for AgentRow {
    fn from(agent: &AgentConfig) -> Self {
        let reasoning_effort = if is_reasoning_model(&agent.model) {
            agent
                .reasoning_effort
                .clone()
                .unwrap_or_else(|| DEFAULT_REASONING_EFFORT.to_string())
        } else {
            "-".to_string()
        };

        Self {
            name: agent.name.clone(),
            entity_id: agent.entity_id(),
            kind: agent.kind.as_str(),
            model: model_display_name(&agent.model).to_string(),
            control: !agent.llm_hass_api.is_empty(),
            web_search: agent.web_search,
            reasoning_effort,
        }
    }
}

pub fn run(ctx: &RuntimeContext) -> Result<()> {
    let rows: Vec<AgentRow> = ctx.config.agents.iter().map(AgentRow::from).collect();
    print_table(ctx, &rows)
}

/// Pick an agent of `kind` by exact name, entity id, or fuzzy match.
/// Without a query the first agent of that kind is used.
pub fn resolve<'a>(
    agents: &'a [AgentConfig],
    query: Option<&str>,
    kind: AgentKind,
) -> Result<&'a AgentConfig> {
    let candidates: Vec<&AgentConfig> = agents.iter().filter(|a| a.kind == kind).collect();
    if candidates.is_empty() {
        bail!("No {} agent configured", kind.as_str());
    }

    let Some(query) = query else {
        return Ok(candidates[0]);
    };

    if let Some(agent) = candidates
        .iter()
        .copied()
        .find(|a| matches_exactly(a, query))
    {
        return Ok(agent);
    }

    let matcher = SkimMatcherV2::default();
    let best = candidates
        .iter()
        .filter_map(|a| Some((matcher.fuzzy_match(&a.name, query)?, *a)))
        .max_by_key(|(score, _)| *score);

    match best {
        Some((score, agent)) => {
            let name = &agent.name;
            log::debug!("Resolved agent '{query}' to '{name}' (score {score})");
            Ok(agent)
        }
        None => {
            let names: Vec<&str> = candidates.iter().map(|a| a.name.as_str()).collect();
            bail!(
                "No {} agent matches '{query}'. Available: {}",
                kind.as_str(),
                names.join(", ")
            )
        }
    }
}

fn matches_exactly(agent: &AgentConfig, query: &str) -> bool {
    agent.name.eq_ignore_ascii_case(query) || agent.entity_id() == query
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<AgentConfig> {
        vec![
            AgentConfig {
                name: "Sonar".to_string(),
                ..Default::default()
            },
            AgentConfig {
                name: "Kitchen Reasoner".to_string(),
                model: "sonar-reasoning-pro".to_string(),
                llm_hass_api: vec!["assist".to_string()],
                ..Default::default()
            },
            AgentConfig {
                name: "Sonar AI Task".to_string(),
                kind: AgentKind::AiTaskData,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_resolve_default_and_exact() {
        let agents = agents();
        assert_eq!(
            resolve(&agents, None, AgentKind::Conversation)
                .unwrap()
                .name,
            "Sonar"
        );
        assert_eq!(
            resolve(&agents, None, AgentKind::AiTaskData).unwrap().name,
            "Sonar AI Task"
        );
        assert_eq!(
            resolve(&agents, Some("kitchen reasoner"), AgentKind::Conversation)
                .unwrap()
                .name,
            "Kitchen Reasoner"
        );
        let entity_id = Some("conversation.kitchen_reasoner");
        assert_eq!(
            resolve(&agents, entity_id, AgentKind::Conversation)
                .unwrap()
                .name,
            "Kitchen Reasoner"
        );
    }

    #[test]
    fn test_resolve_fuzzy() {
        let agents = agents();
        let agent = resolve(&agents, Some("kitch"), AgentKind::Conversation).unwrap();
        assert_eq!(agent.name, "Kitchen Reasoner");
    }

    #[test]
    fn test_resolve_no_match() {
        let agents = agents();
        let err = resolve(&agents, Some("zzz"), AgentKind::Conversation).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Available: Sonar, Kitchen Reasoner"));

        let only_tasks = vec![agents[2].clone()];
        assert!(resolve(&only_tasks, None, AgentKind::Conversation).is_err());
    }

    #[test]
    fn test_agent_row() {
        let agents = agents();
        let row = AgentRow::from(&agents[1]);
        assert_eq!(row.model, "Sonar Reasoning Pro");
        assert_eq!(row.reasoning_effort, "medium");
        assert!(row.control);

        let row = AgentRow::from(&agents[0]);
        assert_eq!(row.reasoning_effort, "-");
        assert_eq!(row.entity_id, "conversation.sonar");
    }
}
