use std::path::Path;

use serde::{Deserialize, Serialize};
use vblob_types::BLOCK_SIZE;

use crate::error::{LoaderError, LoaderResult};

const MIB: usize = 1024 * 1024;

/// Loader and pager settings.
///
/// Missing fields in a TOML document take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Serve pageable objects on demand instead of loading them whole.
    pub paging_enabled: bool,
    /// Faults that can be staged at the same time.
    pub transfer_slots: usize,
    /// Bytes of device data one slot can stage. Must hold the largest
    /// compressed frame plus one leading block.
    pub transfer_slot_size: usize,
    /// Bytes of decompressed output one slot can hold. Must hold the
    /// largest frame.
    pub scratch_size: usize,
    /// Blocking worker threads available to asynchronous fault requests.
    pub pager_workers: usize,
    /// zstd level used when producing archives.
    pub compression_level: i32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            paging_enabled: true,
            transfer_slots: 4,
            transfer_slot_size: 2 * MIB,
            scratch_size: MIB,
            pager_workers: 4,
            compression_level: vblob_archive::DEFAULT_LEVEL,
        }
    }
}

impl LoaderConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> LoaderResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| LoaderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> LoaderResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LoaderError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize as TOML.
    pub fn to_toml_string(&self) -> LoaderResult<String> {
        toml::to_string_pretty(self).map_err(|e| LoaderError::Config(e.to_string()))
    }

    /// Reject settings the pager cannot run with.
    pub fn validate(&self) -> LoaderResult<()> {
        if self.transfer_slots == 0 {
            return Err(LoaderError::Config("transfer_slots must be at least 1".into()));
        }
        if self.pager_workers == 0 {
            return Err(LoaderError::Config("pager_workers must be at least 1".into()));
        }
        for (name, value) in [
            ("transfer_slot_size", self.transfer_slot_size),
            ("scratch_size", self.scratch_size),
        ] {
            if value == 0 || value % BLOCK_SIZE != 0 {
                return Err(LoaderError::Config(format!(
                    "{name} must be a non-zero multiple of {BLOCK_SIZE}, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let c = LoaderConfig::default();
        assert!(c.paging_enabled);
        assert_eq!(c.transfer_slots, 4);
        assert_eq!(c.transfer_slot_size, 2 * MIB);
        assert_eq!(c.scratch_size, MIB);
        assert_eq!(c.compression_level, 3);
        c.validate().unwrap();
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let c = LoaderConfig::from_toml_str("paging_enabled = false\ntransfer_slots = 2\n").unwrap();
        assert!(!c.paging_enabled);
        assert_eq!(c.transfer_slots, 2);
        assert_eq!(c.scratch_size, MIB);
    }

    #[test]
    fn toml_roundtrip() {
        let c = LoaderConfig {
            pager_workers: 8,
            ..LoaderConfig::default()
        };
        let text = c.to_toml_string().unwrap();
        assert_eq!(LoaderConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn zero_slots_rejected() {
        let err = LoaderConfig::from_toml_str("transfer_slots = 0").unwrap_err();
        assert!(matches!(err, LoaderError::Config(_)));
    }

    #[test]
    fn unaligned_sizes_rejected() {
        let c = LoaderConfig {
            scratch_size: 5000,
            ..LoaderConfig::default()
        };
        assert!(matches!(c.validate(), Err(LoaderError::Config(_))));
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(matches!(
            LoaderConfig::from_toml_str("transfer_slots = \"many\""),
            Err(LoaderError::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pager_workers = 2").unwrap();
        let c = LoaderConfig::load(file.path()).unwrap();
        assert_eq!(c.pager_workers, 2);
    }
}
