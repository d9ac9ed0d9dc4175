//! Run-time option enums and the immutable `RunConfig` built from them.
//!
//! Every enum parses from and prints as its lowercase CLI spelling, so the
//! CLI layer, the project file, and the report all agree on one vocabulary.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! option_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every recognized value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The lowercase spelling used on the command line and in files.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            fn expected() -> String {
                Self::ALL
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim().to_ascii_lowercase();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == needle)
                    .ok_or_else(|| ConfigError::UnknownValue {
                        field: $field,
                        value: s.to_owned(),
                        expected: Self::expected(),
                    })
            }
        }
    };
}

option_enum!(
    /// Pointer width of the extension and of the server that loads it.
    Architecture, "architecture" {
        X86 => "x86",
        X64 => "x64",
    }
);

option_enum!(
    /// Operating system the extension is compiled for.
    TargetOs, "target" {
        Windows => "windows",
        Linux => "linux",
    }
);

option_enum!(
    LogLevel, "log-level" {
        Error => "error",
        Warn => "warn",
        Info => "info",
        Debug => "debug",
        Trace => "trace",
    }
);

option_enum!(
    /// Configuration profile for the build and the database reset.
    Environment, "env" {
        Production => "production",
        Development => "development",
        Test => "test",
    }
);

impl TargetOs {
    /// Rust target triple for this OS at the given pointer width.
    pub fn target_triple(self, arch: Architecture) -> &'static str {
        match (self, arch) {
            (TargetOs::Windows, Architecture::X86) => "i686-pc-windows-msvc",
            (TargetOs::Windows, Architecture::X64) => "x86_64-pc-windows-msvc",
            (TargetOs::Linux, Architecture::X86) => "i686-unknown-linux-gnu",
            (TargetOs::Linux, Architecture::X64) => "x86_64-unknown-linux-gnu",
        }
    }

    /// File extension of a dynamic library on this OS.
    pub fn library_extension(self) -> &'static str {
        match self {
            TargetOs::Windows => "dll",
            TargetOs::Linux => "so",
        }
    }

    /// File name the toolchain gives a `cdylib` named `crate_name`.
    pub fn toolchain_library_name(self, crate_name: &str) -> String {
        match self {
            TargetOs::Windows => format!("{crate_name}.dll"),
            TargetOs::Linux => format!("lib{crate_name}.so"),
        }
    }
}

/// Fully resolved options for one orchestration run.
///
/// Constructed once per invocation and passed by reference through every
/// stage; nothing downstream re-reads flags or the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub architecture: Architecture,
    pub target_os: TargetOs,
    pub log_level: LogLevel,
    pub environment: Environment,
}

impl RunConfig {
    pub fn new(
        architecture: Architecture,
        target_os: TargetOs,
        log_level: LogLevel,
        environment: Environment,
    ) -> Self {
        Self {
            architecture,
            target_os,
            log_level,
            environment,
        }
    }

    /// Resolve raw flag values. Any unrecognized value is rejected here,
    /// before a pipeline exists.
    pub fn from_flags(
        use_x32: bool,
        target: &str,
        log_level: &str,
        environment: &str,
    ) -> Result<Self, ConfigError> {
        let architecture = if use_x32 {
            Architecture::X86
        } else {
            Architecture::X64
        };
        Ok(Self {
            architecture,
            target_os: target.parse()?,
            log_level: log_level.parse()?,
            environment: environment.parse()?,
        })
    }

    pub fn target_triple(&self) -> &'static str {
        self.target_os.target_triple(self.architecture)
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} log={} env={}",
            self.target_os, self.architecture, self.log_level, self.environment
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Windows".parse::<TargetOs>().unwrap(), TargetOs::Windows);
        assert_eq!(" TRACE ".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("test".parse::<Environment>().unwrap(), Environment::Test);
    }

    #[test]
    fn unknown_value_lists_expected() {
        let err = "staging".parse::<Environment>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("staging"));
        assert!(msg.contains("production, development, test"));
    }

    #[test]
    fn display_roundtrips_through_from_str() {
        for level in LogLevel::ALL {
            assert_eq!(level.to_string().parse::<LogLevel>().unwrap(), *level);
        }
    }

    #[test]
    fn from_flags_defaults_to_x64() {
        let config = RunConfig::from_flags(false, "windows", "debug", "development").unwrap();
        assert_eq!(config.architecture, Architecture::X64);
        assert_eq!(config.target_triple(), "x86_64-pc-windows-msvc");

        let config = RunConfig::from_flags(true, "windows", "debug", "development").unwrap();
        assert_eq!(config.architecture, Architecture::X86);
        assert_eq!(config.target_triple(), "i686-pc-windows-msvc");
    }

    #[test]
    fn from_flags_rejects_unknown_log_level() {
        let err = RunConfig::from_flags(false, "windows", "verbose", "test").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownValue {
                field: "log-level",
                ..
            }
        ));
    }

    #[test]
    fn toolchain_library_names() {
        assert_eq!(
            TargetOs::Windows.toolchain_library_name("esm_arma"),
            "esm_arma.dll"
        );
        assert_eq!(
            TargetOs::Linux.toolchain_library_name("esm_arma"),
            "libesm_arma.so"
        );
    }

    #[test]
    fn run_config_display() {
        let config = RunConfig::new(
            Architecture::X86,
            TargetOs::Windows,
            LogLevel::Info,
            Environment::Production,
        );
        assert_eq!(config.to_string(), "windows/x86 log=info env=production");
    }
}
