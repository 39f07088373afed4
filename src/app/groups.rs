use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::app::config::AppData;
use crate::app::error::AppError;

pub const UNGROUPED: &str = "Ungrouped";
pub const MAX_GROUP_NAME_CHARS: usize = 64;

fn group_name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[\w\s\-.\[\]()]+$").expect("valid group name regex"))
}

/// Trims and checks a group label; returns the trimmed name.
pub fn validate_group_name(name: &str, trace_id: &str) -> Result<String, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("Group name is required", trace_id));
    }
    if trimmed.chars().count() > MAX_GROUP_NAME_CHARS {
        return Err(AppError::validation(
            format!("Group name must be at most {MAX_GROUP_NAME_CHARS} characters"),
            trace_id,
        ));
    }
    if !group_name_regex().is_match(trimmed) {
        return Err(AppError::validation(
            format!("Group name '{trimmed}' contains unsupported characters"),
            trace_id,
        ));
    }
    Ok(trimmed.to_string())
}

/// Device -> group label. A device without an entry is in `Ungrouped`, so every device
/// always has exactly one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceGroups {
    assignments: BTreeMap<String, String>,
}

impl DeviceGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted map, skipping blank keys and labels.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let assignments = map
            .iter()
            .map(|(device, group)| (device.trim().to_string(), group.trim().to_string()))
            .filter(|(device, group)| !device.is_empty() && !group.is_empty() && group != UNGROUPED)
            .collect();
        Self { assignments }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.assignments.clone()
    }

    pub fn load(data: &AppData) -> Self {
        Self::from_map(&data.device_groups)
    }

    pub fn store(&self, data: &mut AppData) {
        data.device_groups = self.to_map();
    }

    pub fn group_of(&self, device: &str) -> &str {
        self.assignments
            .get(device.trim())
            .map(String::as_str)
            .unwrap_or(UNGROUPED)
    }

    pub fn assign(&mut self, device: &str, group: &str, trace_id: &str) -> Result<(), AppError> {
        let device = device.trim();
        if device.is_empty() {
            return Err(AppError::validation("device is required", trace_id));
        }
        let group = validate_group_name(group, trace_id)?;
        if group == UNGROUPED {
            self.assignments.remove(device);
        } else {
            self.assignments.insert(device.to_string(), group);
        }
        Ok(())
    }

    /// Moves `device` back to `Ungrouped`. Returns false when it already was.
    pub fn reset(&mut self, device: &str) -> bool {
        self.assignments.remove(device.trim()).is_some()
    }

    /// Drops a deleted device's assignment.
    pub fn forget(&mut self, device: &str) -> bool {
        self.reset(device)
    }

    /// Renames a group, merging into `to` if it already exists. Returns how many devices moved.
    pub fn rename(&mut self, from: &str, to: &str, trace_id: &str) -> Result<usize, AppError> {
        let from = from.trim();
        if from == UNGROUPED {
            return Err(AppError::validation(
                format!("'{UNGROUPED}' cannot be renamed"),
                trace_id,
            ));
        }
        let to = validate_group_name(to, trace_id)?;
        let mut moved = 0;
        let mut cleared = Vec::new();
        for (device, group) in self.assignments.iter_mut() {
            if group.as_str() != from {
                continue;
            }
            moved += 1;
            if to == UNGROUPED {
                cleared.push(device.clone());
            } else {
                *group = to.clone();
            }
        }
        for device in cleared {
            self.assignments.remove(&device);
        }
        Ok(moved)
    }

    /// Deletes a group, moving its devices to `reassign_to` (default `Ungrouped`).
    pub fn delete(
        &mut self,
        group: &str,
        reassign_to: Option<&str>,
        trace_id: &str,
    ) -> Result<usize, AppError> {
        let group = group.trim();
        if group == UNGROUPED {
            return Err(AppError::validation(
                format!("'{UNGROUPED}' cannot be deleted"),
                trace_id,
            ));
        }
        let target = match reassign_to {
            Some(target) => validate_group_name(target, trace_id)?,
            None => UNGROUPED.to_string(),
        };
        if target == group {
            return Err(AppError::validation(
                "Cannot reassign devices to the group being deleted",
                trace_id,
            ));
        }
        self.rename(group, &target, trace_id)
    }

    /// `Ungrouped` first, then every assigned label, case-insensitively sorted.
    pub fn all_groups(&self) -> Vec<String> {
        let labels: BTreeSet<&String> = self.assignments.values().collect();
        let mut groups: Vec<String> = labels.into_iter().cloned().collect();
        groups.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then(a.cmp(b)));
        groups.insert(0, UNGROUPED.to_string());
        groups
    }

    /// Members of `group` among `devices`, in the given order.
    pub fn devices_in(&self, group: &str, devices: &[String]) -> Vec<String> {
        let group = group.trim();
        devices
            .iter()
            .filter(|device| self.group_of(device) == group)
            .cloned()
            .collect()
    }

    /// Splits a selection by group, in `all_groups` order; empty groups are omitted.
    pub fn partition(&self, devices: &[String]) -> Vec<(String, Vec<String>)> {
        self.all_groups()
            .into_iter()
            .filter_map(|group| {
                let members = self.devices_in(&group, devices);
                if members.is_empty() {
                    None
                } else {
                    Some((group, members))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ERR_VALIDATION;

    fn devices(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn sample() -> DeviceGroups {
        let mut groups = DeviceGroups::new();
        groups.assign("A", "lab", "t").unwrap();
        groups.assign("B", "Bench (2)", "t").unwrap();
        groups.assign("C", "lab", "t").unwrap();
        groups
    }

    #[test]
    fn validates_names() {
        assert_eq!(validate_group_name("  QA-rack [1].v2 ", "t").unwrap(), "QA-rack [1].v2");
        for bad in ["", "   ", "lab/1", "rm -rf *", "semi;colon"] {
            let err = validate_group_name(bad, "t").unwrap_err();
            assert_eq!(err.code, ERR_VALIDATION, "name {bad:?}");
        }
        assert!(validate_group_name(&"x".repeat(64), "t").is_ok());
        assert!(validate_group_name(&"x".repeat(65), "t").is_err());
    }

    #[test]
    fn every_device_has_one_group() {
        let mut groups = sample();
        assert_eq!(groups.group_of("A"), "lab");
        assert_eq!(groups.group_of("unknown"), UNGROUPED);
        groups.assign("A", "bench", "t").unwrap();
        assert_eq!(groups.group_of("A"), "bench");
        assert!(groups.reset("A"));
        assert!(!groups.reset("A"));
        assert_eq!(groups.group_of("A"), UNGROUPED);
    }

    #[test]
    fn forgetting_a_device_drops_its_assignment() {
        let mut groups = sample();
        assert!(groups.forget(" A "));
        assert!(!groups.forget("A"));
        assert!(!groups.forget("never-seen"));
        assert_eq!(groups.group_of("A"), UNGROUPED);
        assert_eq!(groups.devices_in("lab", &devices(&["A", "C"])), devices(&["C"]));
    }

    #[test]
    fn lists_ungrouped_first_then_case_insensitive() {
        let mut groups = sample();
        groups.assign("D", "alpha", "t").unwrap();
        assert_eq!(groups.all_groups(), vec![UNGROUPED, "alpha", "Bench (2)", "lab"]);
    }

    #[test]
    fn rename_and_delete_move_devices() {
        let mut groups = sample();
        assert_eq!(groups.rename("lab", "rack", "t").unwrap(), 2);
        assert_eq!(groups.group_of("C"), "rack");
        assert_eq!(groups.delete("rack", None, "t").unwrap(), 2);
        assert_eq!(groups.group_of("A"), UNGROUPED);
        assert_eq!(groups.delete("Bench (2)", Some("lab"), "t").unwrap(), 1);
        assert_eq!(groups.group_of("B"), "lab");
        assert!(groups.delete(UNGROUPED, None, "t").is_err());
        assert!(groups.rename(UNGROUPED, "x", "t").is_err());
    }

    #[test]
    fn partitions_selection_by_group() {
        let groups = sample();
        let selection = devices(&["C", "Z", "B", "A"]);
        assert_eq!(
            groups.partition(&selection),
            vec![
                (UNGROUPED.to_string(), devices(&["Z"])),
                ("Bench (2)".to_string(), devices(&["B"])),
                ("lab".to_string(), devices(&["C", "A"])),
            ]
        );
        assert_eq!(groups.devices_in(UNGROUPED, &selection), devices(&["Z"]));
    }

    #[test]
    fn map_round_trip_skips_blank_and_ungrouped() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), "lab".to_string());
        map.insert("B".to_string(), UNGROUPED.to_string());
        map.insert("C".to_string(), "  ".to_string());
        let groups = DeviceGroups::from_map(&map);
        assert_eq!(groups.to_map().len(), 1);
        assert_eq!(groups.group_of("B"), UNGROUPED);
    }

    #[test]
    fn stores_into_app_data() {
        let mut data = AppData::default();
        data.device_groups.insert("A".to_string(), "lab".to_string());
        let mut groups = DeviceGroups::load(&data);
        groups.assign("B", "bench", "t").unwrap();
        groups.store(&mut data);
        assert_eq!(data.device_groups.get("B").map(String::as_str), Some("bench"));
        assert_eq!(data.device_groups.len(), 2);
    }
}
