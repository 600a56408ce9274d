//! 轮询组：按轮询周期划分设备变量

use domain::{PollingInterval, Variable, VariableId};
use std::collections::{BTreeMap, HashMap};

/// 同一设备的轮询组集合。每个激活变量恰好属于一个组。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollGroups {
    groups: BTreeMap<PollingInterval, Vec<VariableId>>,
}

impl PollGroups {
    pub fn from_variables<'a>(variables: impl IntoIterator<Item = &'a Variable>) -> Self {
        let mut groups: BTreeMap<PollingInterval, Vec<VariableId>> = BTreeMap::new();
        for variable in variables.into_iter().filter(|v| v.is_active) {
            groups
                .entry(variable.polling_interval)
                .or_default()
                .push(variable.id);
        }
        for ids in groups.values_mut() {
            ids.sort_unstable();
            ids.dedup();
        }
        Self { groups }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PollingInterval, &[VariableId])> {
        self.groups.iter().map(|(interval, ids)| (*interval, ids.as_slice()))
    }

    pub fn intervals(&self) -> Vec<PollingInterval> {
        self.groups.keys().copied().collect()
    }

    pub fn group_of(&self, variable_id: VariableId) -> Option<PollingInterval> {
        self.groups
            .iter()
            .find(|(_, ids)| ids.binary_search(&variable_id).is_ok())
            .map(|(interval, _)| *interval)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn variable_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// 设备变量集合：变量表、地址索引与轮询组一起替换
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    variables: BTreeMap<VariableId, Variable>,
    by_address: HashMap<String, Vec<VariableId>>,
    groups: PollGroups,
}

impl VariableSet {
    pub fn new(variables: Vec<Variable>) -> Self {
        let variables: BTreeMap<VariableId, Variable> =
            variables.into_iter().map(|v| (v.id, v)).collect();
        let mut by_address: HashMap<String, Vec<VariableId>> = HashMap::new();
        for variable in variables.values().filter(|v| v.is_active) {
            by_address
                .entry(variable.address.clone())
                .or_default()
                .push(variable.id);
        }
        let groups = PollGroups::from_variables(variables.values());
        Self {
            variables,
            by_address,
            groups,
        }
    }

    pub fn groups(&self) -> &PollGroups {
        &self.groups
    }

    pub fn get(&self, variable_id: VariableId) -> Option<&Variable> {
        self.variables.get(&variable_id)
    }

    /// 地址对应的激活变量
    pub fn ids_for_address(&self, address: &str) -> &[VariableId] {
        self.by_address
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 轮询组内去重后的地址（保持变量顺序）
    pub fn addresses_of(&self, ids: &[VariableId]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        ids.iter()
            .filter_map(|id| self.variables.get(id))
            .filter(|v| seen.insert(v.address.clone()))
            .map(|v| v.address.clone())
            .collect()
    }

    /// 激活变量的 (地址, 周期)，地址去重，取最短周期
    pub fn active_addresses(&self) -> Vec<(String, PollingInterval)> {
        let mut result: BTreeMap<String, PollingInterval> = BTreeMap::new();
        for variable in self.variables.values().filter(|v| v.is_active) {
            result
                .entry(variable.address.clone())
                .and_modify(|interval| {
                    if variable.polling_interval < *interval {
                        *interval = variable.polling_interval;
                    }
                })
                .or_insert(variable.polling_interval);
        }
        result.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Protocol;

    fn variable(id: VariableId, address: &str, interval: PollingInterval, active: bool) -> Variable {
        Variable {
            id,
            device_id: 1,
            protocol: Protocol::Plc,
            address: address.to_string(),
            polling_interval: interval,
            is_active: active,
            value: None,
            updated_at_ms: None,
            alarm_enabled: false,
            history_enabled: false,
            outbound: None,
        }
    }

    #[test]
    fn each_active_variable_lands_in_exactly_one_group() {
        let variables = vec![
            variable(1, "DB1.DBD0", PollingInterval::Ms100, true),
            variable(2, "DB1.DBD4", PollingInterval::Ms100, true),
            variable(3, "DB1.DBD8", PollingInterval::Sec5, true),
            variable(4, "DB1.DBD12", PollingInterval::Sec5, false),
        ];
        let groups = PollGroups::from_variables(&variables);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.variable_count(), 3);
        assert_eq!(groups.group_of(1), Some(PollingInterval::Ms100));
        assert_eq!(groups.group_of(3), Some(PollingInterval::Sec5));
        assert_eq!(groups.group_of(4), None);
    }

    #[test]
    fn shared_address_is_read_once() {
        let set = VariableSet::new(vec![
            variable(1, "M0.0", PollingInterval::Sec1, true),
            variable(2, "M0.0", PollingInterval::Sec1, true),
            variable(3, "M0.1", PollingInterval::Sec1, true),
        ]);
        let (_, ids) = set.groups().iter().next().expect("group");
        assert_eq!(set.addresses_of(ids), vec!["M0.0".to_string(), "M0.1".to_string()]);
        assert_eq!(set.ids_for_address("M0.0"), &[1, 2]);
    }

    #[test]
    fn active_addresses_take_fastest_interval() {
        let set = VariableSet::new(vec![
            variable(1, "ns=2;s=A", PollingInterval::Sec5, true),
            variable(2, "ns=2;s=A", PollingInterval::Ms500, true),
            variable(3, "ns=2;s=B", PollingInterval::Sec1, false),
        ]);
        assert_eq!(
            set.active_addresses(),
            vec![("ns=2;s=A".to_string(), PollingInterval::Ms500)]
        );
    }
}
