use std::env;

/// Settings for a new interpreter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on cons cells plus environment frames.
    pub heap_capacity: usize,
    /// Abort a top-level run after this many instructions.
    pub max_steps: Option<u64>,
    /// Log every executed instruction.
    pub trace: bool,
    /// Compile the bundled prelude at start-up.
    pub prelude: bool,
    /// Warn when a free variable is neither special nor globally bound.
    pub warn_free_variables: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heap_capacity: 50_000_000,
            max_steps: None,
            trace: false,
            prelude: true,
            warn_free_variables: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `SECD_TRACE=1` and `SECD_MAX_STEPS=<n>`.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if env::var("SECD_TRACE").map(|v| v == "1").unwrap_or(false) {
            config.trace = true;
        }
        if let Ok(steps) = env::var("SECD_MAX_STEPS") {
            match steps.parse() {
                Ok(n) => config.max_steps = Some(n),
                Err(_) => log::warn!("ignoring SECD_MAX_STEPS={:?}: not a number", steps),
            }
        }
        config
    }
}
