//! System prompt assembly for action mode
//!
//! The instruction text and the response schema below are the contract the
//! model is held to. Changing either changes model behavior, so treat them
//! like a wire format.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Serialize;
use serde_json::{json, Value};

/// Shown instead of the entity overview when nothing is exposed
pub const NO_ENTITIES_PROMPT: &str = "Only if the user wants to control a device, tell them to \
expose entities to their voice assistant in Home Assistant.";

const ENTITY_OVERVIEW_HEADER: &str = "An overview of the areas and the devices in this smart home:";

/// Response grammar, usage rules and per-domain cheat-sheet
pub const ACTION_INSTRUCTIONS: &str = r#"You can control devices in the user's smart home.
Always answer with a single JSON object and nothing else, using this format:

{
  "response": "<what you say to the user, plain text, no markdown>",
  "actions": [
    {
      "domain": "<entity domain, e.g. light>",
      "service": "<service name, e.g. turn_on>",
      "target": "<entity_id, e.g. light.kitchen>",
      "data": {<extra service data>} or null,
      "delay_seconds": <seconds to wait before running> or null
    }
  ] or null
}

Rules:
- Only use entity_ids listed in the smart home overview below. Never invent entity_ids.
- Use "actions": null when the user does not ask to change anything (questions, small talk, state queries).
- "response" must describe what you did or will do, in the user's language.
- Put one action per entity. To control several entities, add several actions.
- Actions run in the order they appear in the list.
- Use "delay_seconds" only when the user asks for something to happen later or for a limited time.

Timing examples:
- "Turn on the kitchen light for 30 minutes" means two actions: light.turn_on on light.kitchen with "delay_seconds": null, then light.turn_off on light.kitchen with "delay_seconds": 1800.
- "Turn off the fan in 10 minutes" means one action: fan.turn_off on the fan with "delay_seconds": 600.
- "Open the blinds for an hour" means cover.open_cover now and cover.close_cover with "delay_seconds": 3600.

Common services:
- light: turn_on (data: brightness_pct 0-100, color_temp_kelvin, rgb_color [r, g, b], transition), turn_off, toggle
- switch, fan, input_boolean: turn_on, turn_off, toggle; fan also set_percentage (data: percentage 0-100)
- climate: set_temperature (data: temperature), set_hvac_mode (data: hvac_mode heat|cool|auto|off), turn_on, turn_off
- cover: open_cover, close_cover, stop_cover, set_cover_position (data: position 0-100)
- lock: lock, unlock
- media_player: media_play, media_pause, media_stop, media_next_track, media_previous_track, volume_set (data: volume_level 0.0-1.0), volume_mute (data: is_volume_muted true|false), turn_on, turn_off
- scene: turn_on
- script: turn_on
- vacuum: start, stop, return_to_base
- button, input_button: press"#;

/// Structured-output directive sent with every action-mode request
pub fn action_response_format() -> &'static Value {
    static FORMAT: OnceLock<Value> = OnceLock::new();
    FORMAT.get_or_init(|| {
        json!({
            "type": "json_schema",
            "json_schema": {
                "name": "home_assistant_response",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "response": {"type": "string"},
                        "actions": {
                            "type": ["array", "null"],
                            "items": {
                                "type": "object",
                                "properties": {
                                    "domain": {"type": "string"},
                                    "service": {"type": "string"},
                                    "target": {"type": "string"},
                                    "data": {"type": ["object", "null"]},
                                    "delay_seconds": {"type": ["number", "null"]}
                                },
                                "required": ["domain", "service", "target", "data"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["response", "actions"],
                    "additionalProperties": false
                }
            }
        })
    })
}

/// An entity the user made visible to the assistant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExposedEntity {
    #[serde(skip)]
    pub entity_id: String,
    pub names: String,
    pub domain: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub areas: Option<String>,
}

#[derive(Serialize)]
struct EntityOverview<'a> {
    entities: BTreeMap<&'a str, &'a ExposedEntity>,
}

/// Render the smart home overview, sorted by entity id, at most `limit` entries
pub fn entity_context(entities: &[ExposedEntity], limit: usize) -> String {
    if entities.is_empty() || limit == 0 {
        return NO_ENTITIES_PROMPT.to_string();
    }

    let mut sorted: Vec<&ExposedEntity> = entities.iter().collect();
    sorted.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    if sorted.len() > limit {
        log::warn!(
            "{} exposed entities, only the first {} are described to the model",
            sorted.len(),
            limit
        );
        sorted.truncate(limit);
    }

    let overview = EntityOverview {
        entities: sorted
            .into_iter()
            .map(|e| (e.entity_id.as_str(), e))
            .collect(),
    };

    match serde_yaml::to_string(&overview) {
        Ok(yaml) => format!("{ENTITY_OVERVIEW_HEADER}\n{yaml}"),
        Err(err) => {
            log::warn!("Could not render entity overview: {err}");
            NO_ENTITIES_PROMPT.to_string()
        }
    }
}

/// Known facts about where the home is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub country: Option<String>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Location block, `None` when nothing is known
pub fn home_location_prompt(location: &HomeLocation) -> Option<String> {
    let mut parts = Vec::new();

    if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
        parts.push(format!("Coordinates: {},{}", round3(lat), round3(lon)));
    }
    if let Some(country) = location.country.as_deref().filter(|c| !c.is_empty()) {
        parts.push(format!("Country: {country}"));
    }

    if parts.is_empty() {
        return None;
    }
    Some(format!(
        "User's home location information:\n{}",
        parts.join("\n")
    ))
}

/// Merge the location block with a caller-supplied extra prompt
pub fn extra_system_prompt(location: Option<&str>, caller: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [location, caller]
        .into_iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .collect();

    (!parts.is_empty()).then(|| parts.join("\n"))
}

/// Extra system prompt for an action-mode turn
pub fn build_system_addendum(
    base: Option<&str>,
    grammar: &str,
    entities: &[ExposedEntity],
    limit: usize,
) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(3);
    if let Some(base) = base.filter(|b| !b.is_empty()) {
        parts.push(base.to_string());
    }
    parts.push(grammar.to_string());
    parts.push(entity_context(entities, limit));
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, name: &str, state: &str, area: Option<&str>) -> ExposedEntity {
        ExposedEntity {
            entity_id: id.to_string(),
            names: name.to_string(),
            domain: id.split('.').next().unwrap().to_string(),
            state: state.to_string(),
            areas: area.map(str::to_string),
        }
    }

    #[test]
    fn test_entity_context_lists_entities() {
        let entities = vec![
            entity(
                "light.living_room",
                "living room",
                "on",
                Some("Living Room"),
            ),
            entity("lock.front_door", "front door", "locked", None),
        ];
        let context = entity_context(&entities, 10);

        assert!(context.starts_with(ENTITY_OVERVIEW_HEADER));
        let entity_yaml =
            "entities:\n  light.living_room:\n    names: living room\n    domain: light\n";
        assert!(context.contains(entity_yaml));
        assert!(context.contains("areas: Living Room"));
        assert!(context.contains("lock.front_door:"));
    }

    #[test]
    fn test_entity_context_is_sorted_and_limited() {
        let entities = vec![
            entity("switch.b", "b", "on", None),
            entity("light.a", "a", "on", None),
            entity("switch.c", "c", "on", None),
        ];
        let context = entity_context(&entities, 2);

        let a = context.find("light.a").unwrap();
        let b = context.find("switch.b").unwrap();
        assert!(a < b);
        assert!(!context.contains("switch.c"));
    }

    #[test]
    fn test_entity_context_empty() {
        assert_eq!(entity_context(&[], 50), NO_ENTITIES_PROMPT);
    }

    #[test]
    fn test_entity_context_is_deterministic() {
        let entities = vec![
            entity("light.a", "a", "on", None),
            entity("fan.b", "b", "off", Some("Attic")),
        ];
        let reversed: Vec<_> = entities.iter().rev().cloned().collect();
        assert_eq!(entity_context(&entities, 10), entity_context(&reversed, 10));
    }

    #[test]
    fn test_home_location_prompt() {
        let location = HomeLocation {
            latitude: Some(52.520008),
            longitude: Some(13.404954),
            country: Some("DE".to_string()),
        };
        assert_eq!(
            home_location_prompt(&location).unwrap(),
            "User's home location information:\nCoordinates: 52.52,13.405\nCountry: DE"
        );
    }

    #[test]
    fn test_home_location_prompt_partial_and_empty() {
        let country_only = HomeLocation {
            country: Some("NL".to_string()),
            ..Default::default()
        };
        assert_eq!(
            home_location_prompt(&country_only).unwrap(),
            "User's home location information:\nCountry: NL"
        );

        let latitude_only = HomeLocation {
            latitude: Some(1.0),
            ..Default::default()
        };
        assert_eq!(home_location_prompt(&latitude_only), None);
        assert_eq!(home_location_prompt(&HomeLocation::default()), None);
    }

    #[test]
    fn test_extra_system_prompt() {
        assert_eq!(extra_system_prompt(None, None), None);
        assert_eq!(extra_system_prompt(Some("loc"), None).unwrap(), "loc");
        assert_eq!(
            extra_system_prompt(Some("loc"), Some("extra")).unwrap(),
            "loc\nextra"
        );
        assert_eq!(
            extra_system_prompt(Some(""), Some("extra")).unwrap(),
            "extra"
        );
    }

    #[test]
    fn test_build_system_addendum() {
        let entities = vec![entity("light.a", "a", "on", None)];
        let addendum = build_system_addendum(Some("Be brief."), ACTION_INSTRUCTIONS, &entities, 10);

        assert!(addendum.starts_with("Be brief.\n"));
        assert!(addendum.contains(ACTION_INSTRUCTIONS));
        assert!(addendum.ends_with(&entity_context(&entities, 10)));

        let no_base = build_system_addendum(None, ACTION_INSTRUCTIONS, &[], 10);
        let expected = format!("{ACTION_INSTRUCTIONS}\n{NO_ENTITIES_PROMPT}");
        assert_eq!(no_base, expected);
    }

    #[test]
    fn test_timing_examples_only_use_their_domain_data() {
        let examples: Vec<&str> = ACTION_INSTRUCTIONS
            .lines()
            .skip_while(|line| *line != "Timing examples:")
            .skip(1)
            .take_while(|line| line.starts_with("- "))
            .collect();

        assert_eq!(examples.len(), 3);
        let cover = examples
            .iter()
            .find(|line| line.contains("cover.open_cover"))
            .unwrap();
        assert!(cover.starts_with("- \"Open the blinds for an hour\""));
        assert!(!cover.contains("brightness"));
    }

    #[test]
    fn test_action_response_format_shape() {
        let format = action_response_format();
        let schema = &format["json_schema"]["schema"];

        assert_eq!(format["type"], "json_schema");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["response", "actions"]));
        assert_eq!(
            schema["properties"]["actions"]["items"]["required"],
            json!(["domain", "service", "target", "data"])
        );
        assert_eq!(
            schema["properties"]["actions"]["items"]["additionalProperties"],
            false
        );
    }
}
