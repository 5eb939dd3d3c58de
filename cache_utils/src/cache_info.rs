//! Cache hierarchy description, read from the kernel's sysfs cache topology.
//!
//! Only line size and capacity of the last data level matter to the
//! measurements; both stay overridable since firmware often leaves the
//! sysfs entries empty on embedded boards.

use std::fmt;
use std::fs;
use std::path::Path;

pub const SYSFS_CACHE_DIR: &str = "/sys/devices/system/cpu/cpu0/cache";

pub const DEFAULT_LINE_SIZE: usize = 64;
pub const DEFAULT_CACHE_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    Data,
    Instruction,
    Unified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_type: CacheType,
    pub level: u8,
    pub size: usize,
    pub line_size: Option<usize>,
}

pub fn get_cache_info() -> Vec<CacheInfo> {
    get_cache_info_from(Path::new(SYSFS_CACHE_DIR))
}

pub fn get_cache_info_from(root: &Path) -> Vec<CacheInfo> {
    let mut ret = Vec::new();
    let mut i = 0;
    while let Some(cache_info) = read_index(&root.join(format!("index{}", i))) {
        ret.push(cache_info);
        i += 1;
    }
    ret
}

fn read_field(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|s| s.trim().to_owned())
}

fn read_index(dir: &Path) -> Option<CacheInfo> {
    let cache_type = match read_field(dir, "type")?.as_str() {
        "Data" => CacheType::Data,
        "Instruction" => CacheType::Instruction,
        "Unified" => CacheType::Unified,
        _ => return None,
    };
    let level = read_field(dir, "level")?.parse().ok()?;
    let size = parse_size(&read_field(dir, "size")?)?;
    let line_size = read_field(dir, "coherency_line_size")
        .and_then(|s| s.parse().ok())
        .filter(|&l: &usize| l != 0);
    Some(CacheInfo {
        cache_type,
        level,
        size,
        line_size,
    })
}

/// Parses sysfs sizes such as `32K`, `1M` or `524288`.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 1 << 10),
        'M' | 'm' => (&s[..s.len() - 1], 1 << 20),
        'G' | 'g' => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

/// Highest level cache that holds data.
pub fn last_level_data_cache(infos: &[CacheInfo]) -> Option<CacheInfo> {
    infos
        .iter()
        .filter(|info| info.cache_type != CacheType::Instruction)
        .max_by_key(|info| (info.level, info.size))
        .copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub line_size: usize,
    /// Capacity of the cache level under test.
    pub cache_size: usize,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        CacheGeometry {
            line_size: DEFAULT_LINE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl CacheGeometry {
    pub fn detect() -> Self {
        Self::from_infos(&get_cache_info())
    }

    pub fn from_infos(infos: &[CacheInfo]) -> Self {
        match last_level_data_cache(infos) {
            Some(info) => CacheGeometry {
                line_size: info.line_size.unwrap_or(DEFAULT_LINE_SIZE),
                cache_size: info.size,
            },
            None => {
                log::warn!(
                    "no cache description found in {}, assuming defaults",
                    SYSFS_CACHE_DIR
                );
                Self::default()
            }
        }
    }
}

impl fmt::Display for CacheGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} byte lines, {} KiB cache",
            self.line_size,
            self.cache_size >> 10
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_index(root: &Path, i: usize, fields: &[(&str, &str)]) {
        let dir = root.join(format!("index{}", i));
        fs::create_dir_all(&dir).unwrap();
        for (name, value) in fields {
            fs::write(dir.join(name), format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("32K"), Some(32 << 10));
        assert_eq!(parse_size("1M\n"), Some(1 << 20));
        assert_eq!(parse_size("524288"), Some(524288));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("K"), None);
    }

    #[test]
    fn reads_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let l1d = [
            ("type", "Data"),
            ("level", "1"),
            ("size", "32K"),
            ("coherency_line_size", "64"),
        ];
        let l1i = [("type", "Instruction"), ("level", "1"), ("size", "48K")];
        let l2 = [("type", "Unified"), ("level", "2"), ("size", "1024K")];
        fake_index(root, 0, &l1d);
        fake_index(root, 1, &l1i);
        fake_index(root, 2, &l2);

        let infos = get_cache_info_from(root);
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].line_size, Some(64));
        assert_eq!(infos[1].cache_type, CacheType::Instruction);

        let geometry = CacheGeometry::from_infos(&infos);
        assert_eq!(geometry.cache_size, 1 << 20);
        // missing line size falls back
        assert_eq!(geometry.line_size, DEFAULT_LINE_SIZE);
    }

    #[test]
    fn no_caches_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_cache_info_from(dir.path()).is_empty());
        assert_eq!(CacheGeometry::from_infos(&[]), CacheGeometry::default());
    }
}
