use crate::cache::encoding::TAG_SHIFT;
use crate::error::ConfigError;
use crate::util::{
    page_shift, page_size, DEFAULT_FRAG_ALIGN, DEFAULT_MAX_OVERSIZE_ORDER,
    DEFAULT_MAX_UNITS_PER_KEY, DEFAULT_UNIT_SHIFT, MAX_LOCALITIES, MAX_OVERSIZE_ORDER, MAX_UNIT_SHIFT,
    MIN_UNIT_SHIFT,
};

/// Per-device cache parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// log2 of the unit size.
    pub unit_shift: u32,
    /// Fragment granularity in bytes.
    pub frag_align: usize,
    /// Number of locality domains served.
    pub localities: usize,
    /// Largest extra order of an oversized unit.
    pub max_oversize_order: u32,
    /// Units one `{locality, direction}` key may register.
    pub max_units_per_key: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            unit_shift: DEFAULT_UNIT_SHIFT,
            frag_align: DEFAULT_FRAG_ALIGN,
            localities: 1,
            max_oversize_order: DEFAULT_MAX_OVERSIZE_ORDER,
            max_units_per_key: DEFAULT_MAX_UNITS_PER_KEY,
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `DMACACHE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = CacheConfig::default();
        if let Some(v) = getenv_usize("DMACACHE_UNIT_SHIFT")? {
            cfg.unit_shift = u32::try_from(v).map_err(|_| ConfigError::UnitShift(u32::MAX))?;
        }
        if let Some(v) = getenv_usize("DMACACHE_FRAG_ALIGN")? {
            cfg.frag_align = v;
        }
        if let Some(v) = getenv_usize("DMACACHE_LOCALITIES")? {
            cfg.localities = v;
        }
        if let Some(v) = getenv_usize("DMACACHE_MAX_OVERSIZE_ORDER")? {
            cfg.max_oversize_order =
                u32::try_from(v).map_err(|_| ConfigError::OversizeOrder(u32::MAX))?;
        }
        if let Some(v) = getenv_usize("DMACACHE_MAX_UNITS")? {
            cfg.max_units_per_key = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_UNIT_SHIFT..=MAX_UNIT_SHIFT).contains(&self.unit_shift)
            || self.unit_shift < page_shift()
        {
            return Err(ConfigError::UnitShift(self.unit_shift));
        }
        if !self.frag_align.is_power_of_two() || self.frag_align > page_size() {
            return Err(ConfigError::FragAlign(self.frag_align));
        }
        if self.localities == 0 || self.localities > MAX_LOCALITIES {
            return Err(ConfigError::Localities(self.localities));
        }
        if self.max_oversize_order > MAX_OVERSIZE_ORDER {
            return Err(ConfigError::OversizeOrder(self.max_oversize_order));
        }
        // Unit indexes live between the unit offset and the tag, and an
        // oversized unit spans `1 << max_oversize_order` of them.
        let index_bits = TAG_SHIFT - self.unit_shift;
        if self.max_units_per_key == 0
            || (self.max_units_per_key as u64) > (1u64 << index_bits)
            || self.max_units_per_key < (1usize << self.max_oversize_order)
        {
            return Err(ConfigError::Capacity(self.max_units_per_key));
        }
        Ok(())
    }

    #[inline]
    pub fn unit_size(&self) -> usize {
        1 << self.unit_shift
    }

    /// Page order of one unit.
    #[inline]
    pub fn unit_order(&self) -> u32 {
        self.unit_shift - page_shift()
    }

    /// Largest page order `alloc_pages` accepts.
    #[inline]
    pub fn max_order(&self) -> u32 {
        self.unit_order() + self.max_oversize_order
    }

    /// Fragment slots per unit: one shadow entry and one buffer mark each.
    #[inline]
    pub fn slots_per_unit(&self) -> usize {
        self.unit_size() / self.frag_align
    }
}

/// Parse an environment variable as a usize. Unset means `None`.
fn getenv_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { name, value }),
        Err(_) => Ok(None),
    }
}
