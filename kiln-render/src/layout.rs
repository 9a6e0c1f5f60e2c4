//! Deduplicating descriptor-set-layout and pipeline-layout registries.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use slotmap::SlotMap;

use crate::device::{
    Device, DeviceError, RawPipelineLayoutHandle, RawSetLayoutHandle, SetLayoutBinding,
};
use crate::{PipelineLayoutKey, SetLayoutKey};

pub(crate) struct SetLayoutRecord {
    pub raw: RawSetLayoutHandle,
    pub bindings: Vec<SetLayoutBinding>,
    pub usage_count: u32,
    hash: u64,
}

pub(crate) struct PipelineLayoutRecord {
    pub raw: RawPipelineLayoutHandle,
    pub push_constant_size: u32,
    pub set_layouts: Vec<Option<SetLayoutKey>>,
    pub usage_count: u32,
    hash: u64,
}

/// Both registries key on a hash bucket and compare structurally inside
/// it, so identical layouts always resolve to one entry whose usage
/// count tracks outstanding registrations.
#[derive(Default)]
pub(crate) struct LayoutCache {
    set_layouts: SlotMap<SetLayoutKey, SetLayoutRecord>,
    set_buckets: HashMap<u64, Vec<SetLayoutKey>>,
    pipeline_layouts: SlotMap<PipelineLayoutKey, PipelineLayoutRecord>,
    pipeline_buckets: HashMap<u64, Vec<PipelineLayoutKey>>,
    empty_set_layout: Option<RawSetLayoutHandle>,
}

fn hash_bindings(bindings: &[SetLayoutBinding]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bindings.hash(&mut hasher);
    hasher.finish()
}

fn hash_pipeline_layout(
    push_constant_size: u32,
    set_layouts: &[Option<SetLayoutKey>],
    raw_of: impl Fn(SetLayoutKey) -> u64,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    push_constant_size.hash(&mut hasher);
    for layout in set_layouts {
        match layout {
            Some(key) => raw_of(*key).hash(&mut hasher),
            None => 0u64.hash(&mut hasher),
        }
    }
    hasher.finish()
}

impl LayoutCache {
    pub fn register_set_layout(
        &mut self,
        device: &dyn Device,
        bindings: &[SetLayoutBinding],
    ) -> Result<SetLayoutKey, DeviceError> {
        let hash = hash_bindings(bindings);
        if let Some(bucket) = self.set_buckets.get(&hash) {
            for &key in bucket {
                let record = &self.set_layouts[key];
                if record.bindings == bindings {
                    self.set_layouts[key].usage_count += 1;
                    return Ok(key);
                }
            }
        }

        let raw = device.create_set_layout(bindings)?;
        let key = self.set_layouts.insert(SetLayoutRecord {
            raw,
            bindings: bindings.to_vec(),
            usage_count: 1,
            hash,
        });
        self.set_buckets.entry(hash).or_default().push(key);
        Ok(key)
    }

    pub fn release_set_layout(&mut self, device: &dyn Device, key: SetLayoutKey) {
        let Some(record) = self.set_layouts.get_mut(key) else {
            return;
        };
        debug_assert!(record.usage_count > 0);
        record.usage_count -= 1;
        if record.usage_count > 0 {
            return;
        }

        let record = self.set_layouts.remove(key).expect("checked above");
        if let Some(bucket) = self.set_buckets.get_mut(&record.hash) {
            bucket.retain(|&entry| entry != key);
        }
        device.destroy_set_layout(record.raw);
    }

    pub fn set_layout_raw(&self, key: SetLayoutKey) -> Option<RawSetLayoutHandle> {
        self.set_layouts.get(key).map(|record| record.raw)
    }

    /// Registers a pipeline layout; `None` slots stand for an empty set
    /// layout shared by the whole registry.
    pub fn register_pipeline_layout(
        &mut self,
        device: &dyn Device,
        push_constant_size: u32,
        set_layouts: &[Option<SetLayoutKey>],
    ) -> Result<PipelineLayoutKey, DeviceError> {
        let hash = hash_pipeline_layout(push_constant_size, set_layouts, |key| {
            self.set_layouts.get(key).map(|record| record.raw.0).unwrap_or(0)
        });

        if let Some(bucket) = self.pipeline_buckets.get(&hash) {
            for &key in bucket {
                let record = &self.pipeline_layouts[key];
                if record.push_constant_size == push_constant_size
                    && record.set_layouts == set_layouts
                {
                    self.pipeline_layouts[key].usage_count += 1;
                    return Ok(key);
                }
            }
        }

        let empty = match self.empty_set_layout {
            Some(empty) => empty,
            None => {
                let empty = device.create_set_layout(&[])?;
                self.empty_set_layout = Some(empty);
                empty
            }
        };

        let raw_set_layouts: Vec<RawSetLayoutHandle> = set_layouts
            .iter()
            .map(|layout| match layout {
                Some(key) => self
                    .set_layouts
                    .get(*key)
                    .map(|record| record.raw)
                    .unwrap_or(empty),
                None => empty,
            })
            .collect();

        let raw = device.create_pipeline_layout(push_constant_size, &raw_set_layouts)?;
        let key = self.pipeline_layouts.insert(PipelineLayoutRecord {
            raw,
            push_constant_size,
            set_layouts: set_layouts.to_vec(),
            usage_count: 1,
            hash,
        });
        self.pipeline_buckets.entry(hash).or_default().push(key);
        Ok(key)
    }

    pub fn release_pipeline_layout(&mut self, device: &dyn Device, key: PipelineLayoutKey) {
        let Some(record) = self.pipeline_layouts.get_mut(key) else {
            return;
        };
        debug_assert!(record.usage_count > 0);
        record.usage_count -= 1;
        if record.usage_count > 0 {
            return;
        }

        let record = self.pipeline_layouts.remove(key).expect("checked above");
        if let Some(bucket) = self.pipeline_buckets.get_mut(&record.hash) {
            bucket.retain(|&entry| entry != key);
        }
        device.destroy_pipeline_layout(record.raw);
    }

    pub fn pipeline_layout_raw(&self, key: PipelineLayoutKey) -> Option<RawPipelineLayoutHandle> {
        self.pipeline_layouts.get(key).map(|record| record.raw)
    }

    pub fn pipeline_layout_usage(&self, key: PipelineLayoutKey) -> Option<u32> {
        self.pipeline_layouts.get(key).map(|record| record.usage_count)
    }

    pub fn teardown(&mut self, device: &dyn Device) {
        for (_, record) in self.pipeline_layouts.drain() {
            device.destroy_pipeline_layout(record.raw);
        }
        for (_, record) in self.set_layouts.drain() {
            device.destroy_set_layout(record.raw);
        }
        if let Some(empty) = self.empty_set_layout.take() {
            device.destroy_set_layout(empty);
        }
        self.set_buckets.clear();
        self.pipeline_buckets.clear();
    }
}
