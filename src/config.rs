//! Allocator settings. The process-wide allocator reads these from the
//! environment once, on its first call; embedders build them directly.
//!
//! Reading goes through `libc::getenv()` because `std::env::var()` allocates
//! a `String`, and we are usually being initialized from inside `malloc()`.

use std::ffi::CStr;

use crate::{
    os::mem::page_size,
    pool::{MAX_ORDER, MIN_ORDER},
};

/// NodePool capacity order, capacity is `2^order` blocks
pub const ENV_POOL_ORDER: &CStr = c"MO_POOL_ORDER";

/// Recycle freed mappings (`1`, `true`, `on`, `yes`) or unmap them (`0`,
/// `false`, `off`, `no`)
pub const ENV_REUSE: &CStr = c"MO_REUSE";

/// Minimum alignment of user pointers, a power of two up to the page size
pub const ENV_ALIGNMENT: &CStr = c"MO_ALIGNMENT";

pub const DEFAULT_POOL_ORDER: u32 = 20;

pub const DEFAULT_ALIGNMENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub pool_order: u32,
    pub recycle: bool,
    pub alignment: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_order: DEFAULT_POOL_ORDER,
            recycle: true,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl Config {
    pub fn pool_order(mut self, order: u32) -> Self {
        self.pool_order = order.clamp(MIN_ORDER, MAX_ORDER);
        self
    }

    pub fn recycle(mut self, recycle: bool) -> Self {
        self.recycle = recycle;
        self
    }

    /// Anything that isn't a power of two, or is bigger than a page, is
    /// ignored
    pub fn alignment(mut self, alignment: usize) -> Self {
        if alignment.is_power_of_two() && alignment <= page_size() {
            self.alignment = alignment;
        }
        self
    }

    /// Defaults, overridden by whatever `MO_*` variables are set
    pub fn from_env() -> Self {
        Self::from_lookup(getenv)
    }

    /// Like [`Config::from_env()`], but with an arbitrary variable source.
    /// Unparseable values fall back to the default for that setting.
    pub fn from_lookup<'a>(lookup: impl Fn(&CStr) -> Option<&'a [u8]>) -> Self {
        let mut config = Self::default();
        if let Some(order) = lookup(ENV_POOL_ORDER).and_then(parse_usize) {
            // A non-positive order means "use the default"
            if order > 0 {
                config = config.pool_order(order.min(MAX_ORDER as usize) as u32);
            }
        }
        if let Some(recycle) = lookup(ENV_REUSE).and_then(parse_bool) {
            config = config.recycle(recycle);
        }
        if let Some(alignment) = lookup(ENV_ALIGNMENT).and_then(parse_usize) {
            config = config.alignment(alignment);
        }
        config
    }
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
    // SAFETY: `name` is NUL-terminated. The returned string belongs to the
    // environment block; nobody should be calling `setenv()` while the
    // allocator is starting up.
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        None
    } else {
        // SAFETY: non-null results of getenv() are NUL-terminated strings
        Some(unsafe { CStr::from_ptr(value) }.to_bytes())
    }
}

fn parse_usize(value: &[u8]) -> Option<usize> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

fn parse_bool(value: &[u8]) -> Option<bool> {
    let value = std::str::from_utf8(value).ok()?.trim();
    ["1", "true", "on", "yes"]
        .iter()
        .any(|v| value.eq_ignore_ascii_case(v))
        .then_some(true)
        .or_else(|| {
            ["0", "false", "off", "no"]
                .iter()
                .any(|v| value.eq_ignore_ascii_case(v))
                .then_some(false)
        })
}
