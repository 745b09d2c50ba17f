use crate::hooks::Hooks;

/// Whether a call stack is printed when a signaled error goes unrecovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Backtraces {
    Off = 0,
    /// Follow `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`.
    #[default]
    Env = 1,
    Always = 2,
}

impl Backtraces {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Off,
            2 => Self::Always,
            _ => Self::Env,
        }
    }
}

/// Process-wide settings, applied once by [`init`](crate::init).
#[derive(Debug, Default)]
pub struct Config {
    pub(crate) hooks: Hooks,
    pub(crate) translate_faults: bool,
    pub(crate) backtraces: Backtraces,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Turn hardware faults into exceptions. Off by default.
    pub fn translate_faults(mut self, enabled: bool) -> Self {
        self.translate_faults = enabled;
        self
    }

    pub fn backtraces(mut self, backtraces: Backtraces) -> Self {
        self.backtraces = backtraces;
        self
    }
}
