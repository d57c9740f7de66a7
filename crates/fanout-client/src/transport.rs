use std::str::FromStr;

/// How the process is being run. Mirrors the deployment environments
/// the selector distinguishes between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Development,
    Test,
    Production,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

/// Inputs to transport selection, evaluated once at bus startup.
#[derive(Clone, Copy, Debug)]
pub struct TransportOptions {
    pub run_mode: RunMode,
    /// Opt back into the shared broker under test, for suites that
    /// exercise cross-bus behavior.
    pub force_shared: bool,
    /// Whether the runtime supports a process-wide shared broker.
    pub broker_supported: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Production,
            force_shared: false,
            broker_supported: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    SharedBroker,
    Direct,
}

/// Decide which transport a bus uses. Development and (by default)
/// test runs get an isolated direct connection; production shares the
/// broker whenever the runtime supports it.
pub fn select_transport(options: &TransportOptions) -> TransportKind {
    if !options.broker_supported {
        return TransportKind::Direct;
    }
    match options.run_mode {
        RunMode::Development => TransportKind::Direct,
        RunMode::Test => {
            if options.force_shared {
                TransportKind::SharedBroker
            } else {
                TransportKind::Direct
            }
        }
        RunMode::Production => TransportKind::SharedBroker,
    }
}
