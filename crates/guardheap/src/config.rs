//! Heap options: parsing from an option string and the runtime copy the heap
//! consults on every call.
//!
//! Parsing never allocates: errors borrow the offending text, and
//! [`Options::from_env`] reads the variable through `libc::getenv`.

use crate::error::HeapError;
use crate::util::MAX_STACK_TRACE_DEPTH;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

/// Environment variable read by [`Options::from_env`].
pub const OPTIONS_ENV: &[u8] = b"GUARDHEAP_OPTIONS\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Return freed pages to the free lists. When false they become DEAD forever.
    pub memory_reuse: bool,
    /// Raise SIGTRAP after printing a diagnostic, before aborting.
    pub debugger_calls: bool,
    /// Alignment used when a caller passes 0 (or calls `allocate`).
    pub default_alignment: usize,
    /// Print all live allocations from `terminate`.
    pub dump_allocations_on_exit: bool,
    /// Frames captured per trace; 0 disables capture entirely.
    pub stack_trace_depth: usize,
    /// Accepted for compatibility; periodic wall checks are not supported.
    pub wall_checking_interval: Option<u32>,
}

impl Options {
    pub const DEFAULT: Options = Options {
        memory_reuse: true,
        debugger_calls: false,
        default_alignment: 1,
        dump_allocations_on_exit: false,
        stack_trace_depth: 0,
        wall_checking_interval: None,
    };

    /// Parse an option string on top of the defaults.
    pub fn parse(text: &str) -> Result<Options, ConfigError<'_>> {
        Self::DEFAULT.apply(text)
    }

    /// Apply `key=value` pairs separated by commas or whitespace. A bare key
    /// enables a boolean option.
    pub fn apply(mut self, text: &str) -> Result<Options, ConfigError<'_>> {
        let tokens = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };
            match key {
                "memory_reuse" => self.memory_reuse = parse_bool(key, value)?,
                "debugger_calls" => self.debugger_calls = parse_bool(key, value)?,
                "dump_allocations_on_exit" => {
                    self.dump_allocations_on_exit = parse_bool(key, value)?
                }
                "default_alignment" => {
                    let alignment = parse_usize(key, value)?;
                    if !alignment.is_power_of_two() {
                        return Err(ConfigError::InvalidValue {
                            option: key,
                            value: value.unwrap_or_default(),
                        });
                    }
                    self.default_alignment = alignment;
                }
                "stack_trace_depth" => {
                    let depth = parse_usize(key, value)?;
                    if depth > MAX_STACK_TRACE_DEPTH {
                        return Err(ConfigError::DepthOutOfRange(depth));
                    }
                    self.stack_trace_depth = depth;
                }
                "wall_checking_interval" => {
                    let interval = parse_usize(key, value)?;
                    self.wall_checking_interval = Some(interval.min(u32::MAX as usize) as u32);
                }
                _ => return Err(ConfigError::UnknownOption(key)),
            }
        }
        Ok(self)
    }

    /// Apply `GUARDHEAP_OPTIONS` on top of `base`, if the variable is set.
    ///
    /// # Safety
    /// Calls `libc::getenv`, which races with concurrent `setenv`. The returned
    /// error borrows the environment block, so it must not outlive a later
    /// modification of the variable.
    pub unsafe fn from_env(base: Options) -> Result<Options, ConfigError<'static>> {
        let raw = libc::getenv(OPTIONS_ENV.as_ptr() as *const libc::c_char);
        if raw.is_null() {
            return Ok(base);
        }
        let text = core::ffi::CStr::from_ptr(raw)
            .to_str()
            .map_err(|_| ConfigError::NotUtf8)?;
        base.apply(text)
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::DEFAULT
    }
}

fn parse_bool<'a>(option: &'a str, value: Option<&'a str>) -> Result<bool, ConfigError<'a>> {
    match value {
        None | Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(value) => Err(ConfigError::InvalidValue { option, value }),
    }
}

fn parse_usize<'a>(option: &'a str, value: Option<&'a str>) -> Result<usize, ConfigError<'a>> {
    let value = value.ok_or(ConfigError::MissingValue { option })?;
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { option, value })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError<'a> {
    #[error("unknown option `{0}`")]
    UnknownOption(&'a str),
    #[error("option `{option}` needs a value")]
    MissingValue { option: &'a str },
    #[error("invalid value `{value}` for option `{option}`")]
    InvalidValue { option: &'a str, value: &'a str },
    #[error("stack trace depth {0} exceeds the maximum of {max}", max = MAX_STACK_TRACE_DEPTH)]
    DepthOutOfRange(usize),
    #[error("option string is not valid UTF-8")]
    NotUtf8,
}

/// The heap's live copy of its options. Every field can change at runtime.
pub struct Settings {
    memory_reuse: AtomicBool,
    debugger_calls: AtomicBool,
    default_alignment: AtomicUsize,
    dump_allocations_on_exit: AtomicBool,
    stack_trace_depth: AtomicUsize,
}

impl Settings {
    pub const fn new(options: Options) -> Self {
        Settings {
            memory_reuse: AtomicBool::new(options.memory_reuse),
            debugger_calls: AtomicBool::new(options.debugger_calls),
            default_alignment: AtomicUsize::new(options.default_alignment),
            dump_allocations_on_exit: AtomicBool::new(options.dump_allocations_on_exit),
            stack_trace_depth: AtomicUsize::new(options.stack_trace_depth),
        }
    }

    pub fn store(&self, options: &Options) -> Result<(), HeapError> {
        self.set_default_alignment(options.default_alignment)?;
        self.set_stack_trace_depth(options.stack_trace_depth)?;
        self.set_memory_reuse(options.memory_reuse);
        self.set_debugger_calls(options.debugger_calls);
        self.set_dump_allocations_on_exit(options.dump_allocations_on_exit);
        Ok(())
    }

    pub fn snapshot(&self) -> Options {
        Options {
            memory_reuse: self.memory_reuse(),
            debugger_calls: self.debugger_calls(),
            default_alignment: self.default_alignment(),
            dump_allocations_on_exit: self.dump_allocations_on_exit(),
            stack_trace_depth: self.stack_trace_depth(),
            wall_checking_interval: None,
        }
    }

    #[inline]
    pub fn memory_reuse(&self) -> bool {
        self.memory_reuse.load(Ordering::Relaxed)
    }

    pub fn set_memory_reuse(&self, enabled: bool) {
        self.memory_reuse.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn debugger_calls(&self) -> bool {
        self.debugger_calls.load(Ordering::Relaxed)
    }

    pub fn set_debugger_calls(&self, enabled: bool) {
        self.debugger_calls.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn default_alignment(&self) -> usize {
        self.default_alignment.load(Ordering::Relaxed)
    }

    pub fn set_default_alignment(&self, alignment: usize) -> Result<(), HeapError> {
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidArgument);
        }
        self.default_alignment.store(alignment, Ordering::Relaxed);
        Ok(())
    }

    pub fn dump_allocations_on_exit(&self) -> bool {
        self.dump_allocations_on_exit.load(Ordering::Relaxed)
    }

    pub fn set_dump_allocations_on_exit(&self, enabled: bool) {
        self.dump_allocations_on_exit.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn stack_trace_depth(&self) -> usize {
        self.stack_trace_depth.load(Ordering::Relaxed)
    }

    pub fn set_stack_trace_depth(&self, depth: usize) -> Result<(), HeapError> {
        if depth > MAX_STACK_TRACE_DEPTH {
            return Err(HeapError::InvalidArgument);
        }
        self.stack_trace_depth.store(depth, Ordering::Relaxed);
        Ok(())
    }
}
