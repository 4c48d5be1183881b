use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{
    AllocationFailure, ChannelPointDefinition, ChannelTestInstance, ModuleType, TestPlcChannelConfig,
};

/// 分配结果
///
/// 每个输入定义恰好出现一次：要么在 `mappings` 中，要么在 `errors` 中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub mappings: Vec<ChannelTestInstance>,
    pub errors: Vec<AllocationFailure>,
}

impl AllocationResult {
    /// 合并为完整的批次实例列表（分配失败的定义带有失败标记），按顺序号排列
    pub fn into_instances(self, definitions: &[ChannelPointDefinition]) -> Vec<ChannelTestInstance> {
        let mut instances = self.mappings;
        for failure in self.errors {
            if let Some(definition) = definitions.get(failure.sequence_no as usize) {
                instances.push(ChannelTestInstance::allocation_failed(
                    definition.clone(),
                    failure.sequence_no,
                    failure.reason,
                ));
            }
        }
        instances.sort_by_key(|instance| instance.sequence_no);
        instances
    }

    pub fn allocated_count(&self) -> usize {
        self.mappings.len()
    }
}

/// 按自然顺序比较通讯地址：数字片段按数值比较（AO1_2 < AO1_10）
pub fn natural_address_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_num = take_number(&mut left);
                let r_num = take_number(&mut right);
                let ordering = l_num
                    .trim_start_matches('0')
                    .len()
                    .cmp(&r_num.trim_start_matches('0').len())
                    .then_with(|| l_num.trim_start_matches('0').cmp(r_num.trim_start_matches('0')))
                    .then_with(|| l_num.len().cmp(&r_num.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(l), Some(r)) => {
                if l != r {
                    return l.cmp(&r);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

/// 通道分配服务
///
/// 为每个被测通道定义选择一个互补类型的测试PLC通道：
/// - 候选通道按 (模块类型, 通讯地址) 升序排列，先到先得，保证结果可复现
/// - 有源/无源必须严格一致，禁用的测试通道不参与分配
/// - 某个定义找不到可用通道时记录分配错误并继续分配其余定义
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelAllocationService;

impl ChannelAllocationService {
    pub fn new() -> Self {
        Self
    }

    /// 构建按类型分组、组内有序的候选池
    fn build_pool<'a>(
        &self,
        test_channels: &'a [TestPlcChannelConfig],
    ) -> HashMap<ModuleType, VecDeque<&'a TestPlcChannelConfig>> {
        let mut candidates: Vec<&TestPlcChannelConfig> = Vec::with_capacity(test_channels.len());
        let mut seen_addresses = HashSet::new();

        for channel in test_channels {
            if !channel.is_enabled {
                log::debug!("测试通道 {} 已禁用，跳过", channel.channel_tag);
                continue;
            }
            if !seen_addresses.insert(channel.communication_address.as_str()) {
                log::warn!(
                    "测试通道 {} 的通讯地址 {} 重复，只保留第一个",
                    channel.channel_tag,
                    channel.communication_address
                );
                continue;
            }
            candidates.push(channel);
        }

        candidates.sort_by(|a, b| {
            a.module_type
                .cmp(&b.module_type)
                .then_with(|| natural_address_cmp(&a.communication_address, &b.communication_address))
        });

        let mut pool: HashMap<ModuleType, VecDeque<&TestPlcChannelConfig>> = HashMap::new();
        for channel in candidates {
            pool.entry(channel.module_type).or_default().push_back(channel);
        }
        pool
    }

    /// 分配测试通道
    pub fn allocate(
        &self,
        definitions: &[ChannelPointDefinition],
        test_channels: &[TestPlcChannelConfig],
    ) -> AllocationResult {
        let mut pool = self.build_pool(test_channels);
        let mut mappings = Vec::with_capacity(definitions.len());
        let mut errors = Vec::new();

        for (index, definition) in definitions.iter().enumerate() {
            let sequence_no = index as u32;
            let required_type = definition.module_type.complementary();

            match pool.get_mut(&required_type).and_then(|queue| queue.pop_front()) {
                Some(channel) => {
                    log::debug!(
                        "通道 {} ({}) → 测试通道 {} ({})",
                        definition.tag,
                        definition.module_type,
                        channel.channel_tag,
                        channel.communication_address
                    );
                    mappings.push(ChannelTestInstance::new(definition.clone(), sequence_no, channel));
                }
                None => {
                    let reason = format!(
                        "没有可用的 {} 类型测试通道，无法为 {} 类型通道 {} 分配",
                        required_type, definition.module_type, definition.tag
                    );
                    log::warn!("[分配失败] {}", reason);
                    errors.push(AllocationFailure {
                        sequence_no,
                        definition_id: definition.id.clone(),
                        tag: definition.tag.clone(),
                        module_type: definition.module_type,
                        required_type,
                        reason,
                    });
                }
            }
        }

        log::info!(
            "通道分配完成: 定义 {} 个，成功 {} 个，失败 {} 个",
            definitions.len(),
            mappings.len(),
            errors.len()
        );

        AllocationResult { mappings, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn definition(tag: &str, module_type: ModuleType, address: &str) -> ChannelPointDefinition {
        let def = ChannelPointDefinition::new(tag, module_type, address, "B1");
        if module_type.is_analog() {
            def.with_range(0.0, 100.0)
        } else {
            def
        }
    }

    #[test]
    fn test_complementary_pairing() {
        let service = ChannelAllocationService::new();
        let definitions = vec![
            definition("TT_101", ModuleType::AI, "40001"),
            definition("FV_101", ModuleType::AO, "40003"),
            definition("XS_101", ModuleType::DI, "10001"),
            definition("XV_101", ModuleType::DO, "00001"),
        ];
        let channels = vec![
            TestPlcChannelConfig::new("DI1_1", ModuleType::DI, "10101"),
            TestPlcChannelConfig::new("DO1_1", ModuleType::DO, "00101"),
            TestPlcChannelConfig::new("AI1_1", ModuleType::AI, "30101"),
            TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101"),
        ];

        let result = service.allocate(&definitions, &channels);

        assert!(result.errors.is_empty(), "所有定义都应该分配成功");
        let allocated: Vec<_> = result
            .mappings
            .iter()
            .map(|m| m.test_plc_channel_tag.clone().unwrap())
            .collect();
        assert_eq!(allocated, vec!["AO1_1", "AI1_1", "DO1_1", "DI1_1"]);
    }

    #[test]
    fn test_powered_variant_must_match() {
        let service = ChannelAllocationService::new();
        let definitions = vec![definition("TT_201", ModuleType::AINone, "40001")];
        let channels = vec![TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101")];

        let result = service.allocate(&definitions, &channels);

        assert!(result.mappings.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].required_type, ModuleType::AONone);
    }

    #[test]
    fn test_exhaustion_is_recorded_and_allocation_continues() {
        let service = ChannelAllocationService::new();
        let definitions = vec![
            definition("TT_1", ModuleType::AI, "40001"),
            definition("TT_2", ModuleType::AI, "40003"),
            definition("XS_1", ModuleType::DI, "10001"),
        ];
        let channels = vec![
            TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101"),
            TestPlcChannelConfig::new("DO1_1", ModuleType::DO, "00101"),
        ];

        let result = service.allocate(&definitions, &channels);

        assert_eq!(result.mappings.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].tag, "TT_2");
        assert_eq!(result.errors[0].sequence_no, 1);

        let instances = result.into_instances(&definitions);
        assert_eq!(instances.len(), 3, "失败的定义也必须出现在实例列表中");
        assert!(instances[1].allocation_error.is_some());
        assert_eq!(instances[2].definition.tag, "XS_1");
    }

    #[test]
    fn test_disabled_channels_are_never_allocated() {
        let service = ChannelAllocationService::new();
        let definitions = vec![definition("TT_1", ModuleType::AI, "40001")];
        let mut disabled = TestPlcChannelConfig::new("AO1_1", ModuleType::AO, "40101");
        disabled.is_enabled = false;
        let channels = vec![disabled, TestPlcChannelConfig::new("AO1_2", ModuleType::AO, "40103")];

        let result = service.allocate(&definitions, &channels);

        assert_eq!(result.mappings[0].test_plc_channel_tag.as_deref(), Some("AO1_2"));
    }

    #[test]
    fn test_candidates_use_natural_address_order() {
        let service = ChannelAllocationService::new();
        let definitions = vec![
            definition("TT_1", ModuleType::AI, "40001"),
            definition("TT_2", ModuleType::AI, "40003"),
        ];
        let channels = vec![
            TestPlcChannelConfig::new("AO1_10", ModuleType::AO, "AO1.10"),
            TestPlcChannelConfig::new("AO1_2", ModuleType::AO, "AO1.2"),
        ];

        let result = service.allocate(&definitions, &channels);

        assert_eq!(result.mappings[0].test_plc_communication_address.as_deref(), Some("AO1.2"));
        assert_eq!(result.mappings[1].test_plc_communication_address.as_deref(), Some("AO1.10"));
        assert_eq!(natural_address_cmp("40101", "40101"), Ordering::Equal);
        assert_eq!(natural_address_cmp("DI2", "DI10"), Ordering::Less);
    }

    #[test]
    fn test_allocation_is_injective_total_and_deterministic() {
        let service = ChannelAllocationService::new();
        let types = [ModuleType::AI, ModuleType::AO, ModuleType::DI, ModuleType::DONone];
        let definitions: Vec<_> = (0..23)
            .map(|i| definition(&format!("P_{}", i), types[i % types.len()], &format!("4{:04}", i * 2 + 1)))
            .collect();
        let pool_types = [ModuleType::AO, ModuleType::AI, ModuleType::DO, ModuleType::DINone, ModuleType::DI];
        let channels: Vec<_> = (0..17)
            .map(|i| {
                let module_type = pool_types[i % pool_types.len()];
                TestPlcChannelConfig::new(format!("CH_{}", i), module_type, format!("4{:04}", 100 + i))
            })
            .collect();

        let first = service.allocate(&definitions, &channels);
        let second = service.allocate(&definitions, &channels);

        assert_eq!(
            first.mappings.len() + first.errors.len(),
            definitions.len(),
            "每个定义恰好出现一次"
        );
        let used: HashSet<_> = first
            .mappings
            .iter()
            .map(|m| m.test_plc_communication_address.clone())
            .collect();
        assert_eq!(used.len(), first.mappings.len(), "测试通道不能被重复分配");

        let tags = |r: &AllocationResult| -> Vec<Option<String>> {
            r.mappings.iter().map(|m| m.test_plc_channel_tag.clone()).collect()
        };
        assert_eq!(tags(&first), tags(&second), "相同输入的分配结果必须一致");
    }
}
