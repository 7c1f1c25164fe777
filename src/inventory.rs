//! Exposed-entity inventory backed by a Home Assistant instance
//!
//! Joins the exposure list, the entity/device/area registries (WebSocket)
//! and the current states (REST) into the entity snapshot the prompt needs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{EntityState, HassClient};
use crate::conversation::EntityInventory;
use crate::prompt::{ExposedEntity, HomeLocation};
use crate::websocket::WsClient;

/// Assistant id entities are exposed to
const ASSISTANT: &str = "conversation";

#[derive(Debug, Default, Deserialize)]
pub struct ExposeList {
    #[serde(default)]
    pub exposed_entities: HashMap<String, HashMap<String, Value>>,
}

impl ExposeList {
    fn is_exposed(&self, entity_id: &str) -> bool {
        self.exposed_entities
            .get(entity_id)
            .and_then(|assistants| assistants.get(ASSISTANT))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityEntry {
    pub entity_id: String,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub area_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaEntry {
    pub area_id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Everything needed to describe the exposed entities
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub exposed: ExposeList,
    pub entities: Vec<EntityEntry>,
    pub devices: Vec<DeviceEntry>,
    pub areas: Vec<AreaEntry>,
}

impl RegistrySnapshot {
    pub async fn fetch(ws: &mut WsClient) -> Result<Self> {
        Ok(Self {
            exposed: decode(ws.request("homeassistant/expose_entity/list").await?)
                .context("decoding exposed entity list")?,
            entities: decode(ws.request("config/entity_registry/list").await?)
                .context("decoding entity registry")?,
            devices: decode(ws.request("config/device_registry/list").await?)
                .context("decoding device registry")?,
            areas: decode(ws.request("config/area_registry/list").await?)
                .context("decoding area registry")?,
        })
    }

    /// Join with `states`, keeping only entities exposed to the assistant
    pub fn exposed_entities(&self, states: &[EntityState]) -> Vec<ExposedEntity> {
        let entities: HashMap<&str, &EntityEntry> = self
            .entities
            .iter()
            .map(|e| (e.entity_id.as_str(), e))
            .collect();
        let devices: HashMap<&str, &DeviceEntry> =
            self.devices.iter().map(|d| (d.id.as_str(), d)).collect();
        let areas: HashMap<&str, &AreaEntry> =
            self.areas.iter().map(|a| (a.area_id.as_str(), a)).collect();

        states
            .iter()
            .filter(|state| self.exposed.is_exposed(&state.entity_id))
            .map(|state| {
                let entry = entities.get(state.entity_id.as_str()).copied();

                let mut names = vec![state.name()];
                if let Some(entry) = entry {
                    names.extend(entry.aliases.iter().cloned());
                }

                // Entity area wins over the device area
                let area = entry.and_then(|entry| {
                    entry.area_id.as_deref().or_else(|| {
                        entry
                            .device_id
                            .as_deref()
                            .and_then(|id| devices.get(id))
                            .and_then(|device| device.area_id.as_deref())
                    })
                });
                let areas = area.and_then(|id| areas.get(id)).map(|area| {
                    std::iter::once(area.name.as_str())
                        .chain(area.aliases.iter().map(String::as_str))
                        .collect::<Vec<_>>()
                        .join(", ")
                });

                ExposedEntity {
                    entity_id: state.entity_id.clone(),
                    names: names.join(", "),
                    domain: state.domain().to_string(),
                    state: state.state.clone(),
                    areas,
                }
            })
            .collect()
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Inventory reading a live Home Assistant instance on every turn
pub struct HassInventory {
    rest: Arc<HassClient>,
    server: String,
    token: String,
    overrides: HomeLocation,
}

impl HassInventory {
    pub fn new(rest: Arc<HassClient>, server: &str, token: &str, overrides: HomeLocation) -> Self {
        Self {
            rest,
            server: server.to_string(),
            token: token.to_string(),
            overrides,
        }
    }
}

#[async_trait]
impl EntityInventory for HassInventory {
    async fn exposed_entities(&self) -> Result<Vec<ExposedEntity>> {
        let mut ws = WsClient::connect(&self.server, &self.token).await?;
        let snapshot = RegistrySnapshot::fetch(&mut ws).await?;
        let states = self.rest.get_states().await?;

        let exposed = snapshot.exposed_entities(&states);
        log::debug!("{} of {} entities exposed", exposed.len(), states.len());
        Ok(exposed)
    }

    async fn home_location(&self) -> Result<HomeLocation> {
        let config = self.rest.get_config().await?;
        Ok(HomeLocation {
            latitude: config.latitude.or(self.overrides.latitude),
            longitude: config.longitude.or(self.overrides.longitude),
            country: config.country.or_else(|| self.overrides.country.clone()),
        })
    }
}
