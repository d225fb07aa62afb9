//! Topic registry: the fixed topic set of a session, its keyword groups, and
//! the building entities each topic is linked to.
//!
//! Group membership is a case-insensitive substring match of the group keyword
//! against the full topic string. The group → topics map is computed once at
//! construction and never changes afterwards.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::core::config::TopicsConfig;
use crate::core::errors::{Result, TwinError};
use crate::registry::links;

/// Selection choice that expands to every topic of a group.
pub const ALL_CHOICE: &str = "all";

/// One keyword group and its member topics, in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicGroup {
    pub name: String,
    pub topics: Vec<String>,
    /// Protocol-wide groups (`KNX`, `M-bus`) are too broad to offer "all".
    pub offers_all: bool,
}

/// Immutable topic set with precomputed groups and entity links.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    topics: Vec<String>,
    groups: Vec<TopicGroup>,
    default_group: Option<String>,
    links: BTreeMap<String, Vec<String>>,
}

impl TopicRegistry {
    /// Build a registry over `topics` grouped by `group_keys`.
    ///
    /// Groups named in `protocol_groups` do not offer the "all" choice.
    #[must_use]
    pub fn new(
        topics: Vec<String>,
        group_keys: &[String],
        protocol_groups: &[String],
        default_group: Option<String>,
    ) -> Self {
        let groups = group_keys
            .iter()
            .map(|key| {
                let needle = key.to_lowercase();
                TopicGroup {
                    name: key.clone(),
                    topics: topics
                        .iter()
                        .filter(|topic| topic.to_lowercase().contains(&needle))
                        .cloned()
                        .collect(),
                    offers_all: !protocol_groups.iter().any(|p| p.eq_ignore_ascii_case(key)),
                }
            })
            .collect();

        Self {
            topics,
            groups,
            default_group,
            links: BTreeMap::new(),
        }
    }

    /// Sensor registry: configured sensors, group keys, CSV and inline links.
    pub fn sensors_from_config(cfg: &TopicsConfig) -> Result<Self> {
        let default_group = (!cfg.default_group.is_empty()).then(|| cfg.default_group.clone());
        let registry = Self::new(
            cfg.sensors.clone(),
            &cfg.group_keys,
            &cfg.protocol_groups,
            default_group,
        );
        registry.with_config_links(cfg)
    }

    /// Actuator registry: configured actuators grouped by the actuator keys.
    pub fn actuators_from_config(cfg: &TopicsConfig) -> Result<Self> {
        let registry = Self::new(
            cfg.actuators.clone(),
            &cfg.actuator_group_keys,
            &cfg.protocol_groups,
            None,
        );
        registry.with_config_links(cfg)
    }

    fn with_config_links(mut self, cfg: &TopicsConfig) -> Result<Self> {
        let mut merged = match &cfg.links_csv {
            Some(path) => links::load_csv(path)?,
            None => BTreeMap::new(),
        };
        for (topic, ids) in &cfg.links {
            merged.insert(topic.clone(), ids.clone());
        }
        self.links = merged
            .into_iter()
            .filter(|(topic, _)| self.topics.contains(topic))
            .collect();
        Ok(self)
    }

    /// Replace the entity links wholesale. Links for unknown topics are kept.
    #[must_use]
    pub fn with_links(mut self, links: BTreeMap<String, Vec<String>>) -> Self {
        self.links = links;
        self
    }

    /// All topics in configuration order.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    #[must_use]
    pub fn groups(&self) -> &[TopicGroup] {
        &self.groups
    }

    /// Look up a group by exact name.
    pub fn group(&self, name: &str) -> Result<&TopicGroup> {
        self.groups
            .iter()
            .find(|group| group.name == name)
            .ok_or_else(|| TwinError::UnknownGroup {
                group: name.to_string(),
            })
    }

    /// Choices offered for a group: `"all"` first (unless protocol-wide), then each topic.
    pub fn topic_options(&self, group: &str) -> Result<Vec<String>> {
        let group = self.group(group)?;
        let mut options = Vec::with_capacity(group.topics.len() + 1);
        if group.offers_all {
            options.push(ALL_CHOICE.to_string());
        }
        options.extend(group.topics.iter().cloned());
        Ok(options)
    }

    /// Resolve a (group, choice) pair to the ordered topic list to publish.
    ///
    /// `"all"` expands to the group's topics; anything else must be a known topic.
    pub fn resolve_selection(&self, group: &str, choice: &str) -> Result<Vec<String>> {
        let group = self.group(group)?;
        if choice == ALL_CHOICE {
            return Ok(group.topics.clone());
        }
        if !self.contains(choice) {
            return Err(TwinError::UnknownTopic {
                topic: choice.to_string(),
            });
        }
        Ok(vec![choice.to_string()])
    }

    /// Name of the group selected when the operator has not chosen one.
    #[must_use]
    pub fn default_group(&self) -> Option<&str> {
        self.default_group.as_deref()
    }

    /// Topics of the default group, or empty when none is configured.
    #[must_use]
    pub fn default_selection(&self) -> Vec<String> {
        self.default_group
            .as_deref()
            .and_then(|name| self.group(name).ok())
            .map(|group| group.topics.clone())
            .unwrap_or_default()
    }

    /// Building entity ids linked to `topic`; empty when unlinked.
    #[must_use]
    pub fn entities_for(&self, topic: &str) -> &[String] {
        self.links.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Entity ids of every topic in `selection`, deduplicated in first-seen order.
    #[must_use]
    pub fn entities_for_selection(&self, selection: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for topic in selection {
            for id in self.entities_for(topic) {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out
    }
}

fn label_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"<([^<>]+)>\s*$").ok())
        .as_ref()
}

/// Human-readable label of a topic.
///
/// `KNX/13/0/0<Livingroom.Sensors.CO2-ppm>` → `Livingroom.Sensors.CO2-ppm`.
/// Topics without an angle-bracket suffix are returned unchanged.
#[must_use]
pub fn topic_label(topic: &str) -> &str {
    label_pattern()
        .and_then(|re| re.captures(topic))
        .and_then(|caps| caps.get(1))
        .map_or(topic, |m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TopicsConfig;

    fn lab_registry() -> TopicRegistry {
        TopicRegistry::sensors_from_config(&TopicsConfig::default()).unwrap()
    }

    #[test]
    fn groups_match_case_insensitively() {
        let registry = lab_registry();
        let rh = registry.group("Rh").unwrap();
        // "Rh-percent" and "RH|percent" both belong to the Rh group.
        assert_eq!(rh.topics.len(), 3);
        assert!(
            rh.topics
                .contains(&"KNX/15/0/1<Bathroom.Sensors.RH|percent>".to_string())
        );
    }

    #[test]
    fn room_group_keeps_registry_order() {
        let registry = lab_registry();
        assert_eq!(
            registry.group("Livingroom").unwrap().topics,
            vec![
                "KNX/13/0/2<Livingroom.Sensors.Air-temperature-C>".to_string(),
                "KNX/13/0/3<Livingroom.Sensors.Floor-temp-C>".to_string(),
                "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>".to_string(),
                "KNX/13/0/1<Livingroom.Sensors.Rh-percent>".to_string(),
            ]
        );
    }

    #[test]
    fn protocol_groups_offer_no_all_choice() {
        let registry = lab_registry();
        let knx = registry.topic_options("KNX").unwrap();
        assert_eq!(knx.len(), 11);
        assert!(!knx.contains(&ALL_CHOICE.to_string()));

        let mbus = registry.topic_options("M-bus").unwrap();
        assert!(mbus.is_empty());

        let bedroom = registry.topic_options("Bedroom").unwrap();
        assert_eq!(bedroom[0], ALL_CHOICE);
        assert_eq!(bedroom.len(), 4);
    }

    #[test]
    fn all_expands_to_group_topics() {
        let registry = lab_registry();
        let selection = registry.resolve_selection("CO2-ppm", ALL_CHOICE).unwrap();
        assert_eq!(selection.len(), 3);
        assert!(selection.iter().all(|t| t.contains("CO2-ppm")));
    }

    #[test]
    fn single_choice_must_be_known() {
        let registry = lab_registry();
        let topic = "KNX/14/0/0<Bedroom.Sensors.CO2-ppm>";
        assert_eq!(
            registry.resolve_selection("Bedroom", topic).unwrap(),
            vec![topic.to_string()]
        );

        let err = registry
            .resolve_selection("Bedroom", "KNX/99/0/0<Attic.Sensors.CO2-ppm>")
            .unwrap_err();
        assert_eq!(err.code(), "SLT-1102");
    }

    #[test]
    fn unknown_group_rejected() {
        let err = lab_registry().topic_options("Garage").unwrap_err();
        assert!(matches!(err, TwinError::UnknownGroup { .. }));
    }

    #[test]
    fn default_selection_is_livingroom() {
        let registry = lab_registry();
        let selection = registry.default_selection();
        assert_eq!(selection.len(), 4);
        assert!(selection.iter().all(|t| t.contains("Livingroom")));
    }

    #[test]
    fn inline_links_limited_to_known_topics() {
        let mut cfg = TopicsConfig::default();
        cfg.links.insert(
            "KNX/13/0/0<Livingroom.Sensors.CO2-ppm>".to_string(),
            vec!["guid-living".to_string()],
        );
        cfg.links
            .insert("unknown/topic".to_string(), vec!["guid-x".to_string()]);
        let registry = TopicRegistry::sensors_from_config(&cfg).unwrap();

        assert_eq!(
            registry.entities_for("KNX/13/0/0<Livingroom.Sensors.CO2-ppm>"),
            ["guid-living".to_string()]
        );
        assert!(registry.entities_for("unknown/topic").is_empty());
    }

    #[test]
    fn selection_entities_deduplicated() {
        let mut links = BTreeMap::new();
        links.insert("a".to_string(), vec!["g1".to_string(), "g2".to_string()]);
        links.insert("b".to_string(), vec!["g2".to_string(), "g3".to_string()]);
        let registry = TopicRegistry::new(
            vec!["a".to_string(), "b".to_string()],
            &[],
            &[],
            None,
        )
        .with_links(links);

        assert_eq!(
            registry.entities_for_selection(&["a".to_string(), "b".to_string()]),
            vec!["g1".to_string(), "g2".to_string(), "g3".to_string()]
        );
    }

    #[test]
    fn actuator_registry_groups_by_device_kind() {
        let registry = TopicRegistry::actuators_from_config(&TopicsConfig::default()).unwrap();
        assert_eq!(registry.topics().len(), 2);
        assert_eq!(registry.group("Curtain").unwrap().topics.len(), 1);
        assert_eq!(registry.group("Bedroom").unwrap().topics.len(), 2);
        assert!(registry.default_selection().is_empty());
    }

    #[test]
    fn label_extracts_bracket_text() {
        assert_eq!(
            topic_label("KNX/13/0/0<Livingroom.Sensors.CO2-ppm>"),
            "Livingroom.Sensors.CO2-ppm"
        );
        assert_eq!(
            topic_label("KNX/0/5/0<Actuators.Curtain.Bedroom-Up|Down>"),
            "Actuators.Curtain.Bedroom-Up|Down"
        );
        assert_eq!(
            topic_label("M-bus/Electricity/Current L2"),
            "M-bus/Electricity/Current L2"
        );
    }
}
