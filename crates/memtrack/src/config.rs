use std::sync::atomic::{AtomicU8, Ordering};

use crate::guard::{self, GuardMode};
use crate::output::{self, Format};
use crate::registry;

pub const FORMAT_ENV: &str = "MEMTRACK_FORMAT";
pub const GUARD_ENV: &str = "MEMTRACK_GUARD";
pub const QUIET_ENV: &str = "MEMTRACK_QUIET";

// Settings live in atomics owned by the components that read them, so the
// allocation path never has to look at the environment.
static FORMAT: AtomicU8 = AtomicU8::new(Format::Text.to_u8());

#[inline]
pub(crate) fn format() -> Format {
    Format::from_u8(FORMAT.load(Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub format: Format,
    pub guard_mode: GuardMode,
    pub warn_unknown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: Format::default(),
            guard_mode: GuardMode::default(),
            warn_unknown: true,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Defaults overridden by `MEMTRACK_FORMAT`, `MEMTRACK_GUARD` and
    /// `MEMTRACK_QUIET`. Unparseable values are reported and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(FORMAT_ENV) {
            match raw.parse() {
                Ok(format) => config.format = format,
                Err(e) => output::warn(format_args!("ignoring {}: {}", FORMAT_ENV, e)),
            }
        }

        if let Some(raw) = lookup(GUARD_ENV) {
            match raw.parse() {
                Ok(mode) => config.guard_mode = mode,
                Err(e) => output::warn(format_args!("ignoring {}: {}", GUARD_ENV, e)),
            }
        }

        if let Some(raw) = lookup(QUIET_ENV) {
            config.warn_unknown = !(raw.eq_ignore_ascii_case("true") || raw == "1");
        }

        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn format(mut self, format: Format) -> Self {
        self.config.format = format;
        self
    }

    pub fn guard_mode(mut self, mode: GuardMode) -> Self {
        self.config.guard_mode = mode;
        self
    }

    pub fn warn_unknown(mut self, enabled: bool) -> Self {
        self.config.warn_unknown = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Applies `config` to the global registry, guard and reporter.
pub fn configure(config: Config) {
    FORMAT.store(config.format.to_u8(), Ordering::Relaxed);
    guard::guard().set_mode(config.guard_mode);
    registry::registry().set_warn_unknown(config.warn_unknown);
}

/// Applies [`Config::from_env`].
pub fn init() {
    configure(Config::from_env());
}
