// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Machine layout consumed by boot, address-space verification and the loader
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MachineConfig{default,from_toml_str,validate}, Region, ConfigError
//! INVARIANTS: Every boundary is page aligned; the kernel image and stack page sit below the
//!             first process address; physical memory fits inside the virtual budget

use serde::Deserialize;
use thiserror::Error;

use crate::page_table::VA_LIMIT;
use crate::physical::{is_page_aligned, Pid, PAGE_SIZE};

/// Half-open physical address range `[start, end)`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Region {
    pub start: usize,
    pub end: usize,
}

impl Region {
    /// Creates a region.
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// Errors raised while loading or validating a [`MachineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML input could not be decoded.
    #[error("failed to parse machine config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A boundary is not a multiple of the page size.
    #[error("{field} ({value:#x}) is not page aligned")]
    Unaligned { field: &'static str, value: usize },
    /// Boundaries are inconsistent with each other.
    #[error("invalid machine layout: {0}")]
    Layout(&'static str),
}

/// Memory layout of the modeled machine.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Bytes of physical memory.
    pub physical_size: usize,
    /// Bytes of virtual address space handed to each process.
    pub virtual_size: usize,
    /// First byte of the kernel image.
    pub kernel_start: usize,
    /// End of the kernel image (code and data).
    pub kernel_end: usize,
    /// Top of the kernel stack; the page just below it must stay mapped.
    pub kernel_stack_top: usize,
    /// First address available to applications.
    pub process_start: usize,
    /// Hardware ranges never handed to processes.
    pub reserved: Vec<Region>,
    /// Number of process slots, slot 0 included.
    pub nproc: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            physical_size: 0x20_0000,
            virtual_size: 0x30_0000,
            kernel_start: 0x4_0000,
            kernel_end: 0x7_0000,
            kernel_stack_top: 0x8_0000,
            process_start: 0x10_0000,
            // Null page and the legacy I/O hole.
            reserved: vec![Region::new(0, PAGE_SIZE), Region::new(0xa_0000, 0x10_0000)],
            nproc: 16,
        }
    }
}

impl MachineConfig {
    /// Parses and validates a TOML layout. Missing keys fall back to [`Default`].
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of physical pages.
    pub fn physical_pages(&self) -> usize {
        self.physical_size / PAGE_SIZE
    }

    /// Address of the kernel stack page that must remain mapped.
    pub fn kernel_stack_page(&self) -> usize {
        self.kernel_stack_top - PAGE_SIZE
    }

    /// Checks alignment and ordering of every boundary.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut fields = vec![
            ("physical_size", self.physical_size),
            ("virtual_size", self.virtual_size),
            ("kernel_start", self.kernel_start),
            ("kernel_end", self.kernel_end),
            ("kernel_stack_top", self.kernel_stack_top),
            ("process_start", self.process_start),
        ];
        for region in &self.reserved {
            fields.push(("reserved.start", region.start));
            fields.push(("reserved.end", region.end));
        }
        if let Some((field, value)) = fields.into_iter().find(|(_, value)| !is_page_aligned(*value)) {
            return Err(ConfigError::Unaligned { field, value });
        }

        if self.physical_size == 0 {
            return Err(ConfigError::Layout("physical memory is empty"));
        }
        if self.physical_size > self.virtual_size || self.virtual_size > VA_LIMIT {
            return Err(ConfigError::Layout("virtual size must cover physical memory and fit four levels"));
        }
        if self.kernel_start >= self.kernel_end {
            return Err(ConfigError::Layout("kernel image is empty"));
        }
        if self.kernel_stack_top < PAGE_SIZE || self.kernel_end > self.kernel_stack_page() {
            return Err(ConfigError::Layout("kernel stack overlaps the kernel image"));
        }
        if self.kernel_stack_top > self.process_start || self.process_start > self.physical_size {
            return Err(ConfigError::Layout("kernel must sit below the first process address"));
        }
        for region in &self.reserved {
            if region.start >= region.end || region.end > self.physical_size {
                return Err(ConfigError::Layout("reserved region is empty or beyond memory"));
            }
            if region.overlaps(self.kernel_start, self.kernel_end)
                || region.overlaps(self.kernel_stack_page(), self.kernel_stack_top)
            {
                return Err(ConfigError::Layout("reserved region overlaps the kernel"));
            }
        }
        if self.nproc < 2 || self.nproc > usize::from(Pid::MAX) + 1 {
            return Err(ConfigError::Layout("process table needs between 2 and 65536 slots"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid() {
        let config = MachineConfig::default();
        config.validate().expect("default layout");
        assert_eq!(config.physical_pages(), 512);
        assert_eq!(config.kernel_stack_page(), 0x7_f000);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config = MachineConfig::from_toml_str(
            r#"
            physical_size = 0x100000
            nproc = 4
            reserved = [{ start = 0x0, end = 0x1000 }]
            "#,
        )
        .expect("parse");
        assert_eq!(config.physical_size, 0x10_0000);
        assert_eq!(config.nproc, 4);
        assert_eq!(config.kernel_start, 0x4_0000);
        assert_eq!(config.reserved, vec![Region::new(0, 0x1000)]);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_syntax() {
        assert!(matches!(
            MachineConfig::from_toml_str("page_size = 8192"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(MachineConfig::from_toml_str("nproc = "), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_unaligned_boundaries() {
        let err = MachineConfig::from_toml_str("kernel_end = 0x70010").expect_err("unaligned");
        assert!(matches!(err, ConfigError::Unaligned { field: "kernel_end", value: 0x7_0010 }));
    }

    #[test]
    fn rejects_inconsistent_layouts() {
        let stack_in_image = MachineConfig { kernel_end: 0x8_0000, ..MachineConfig::default() };
        assert!(matches!(stack_in_image.validate(), Err(ConfigError::Layout(_))));

        let reserved_kernel = MachineConfig {
            reserved: vec![Region::new(0x4_0000, 0x4_1000)],
            ..MachineConfig::default()
        };
        assert!(matches!(reserved_kernel.validate(), Err(ConfigError::Layout(_))));

        let too_big = MachineConfig { physical_size: 0x40_0000, ..MachineConfig::default() };
        assert!(matches!(too_big.validate(), Err(ConfigError::Layout(_))));

        let lonely = MachineConfig { nproc: 1, ..MachineConfig::default() };
        assert!(matches!(lonely.validate(), Err(ConfigError::Layout(_))));
    }
}
