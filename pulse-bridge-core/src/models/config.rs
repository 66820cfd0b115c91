use std::ops::BitOr;

/// Flags passed to the native connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextFlags(u32);

impl ContextFlags {
    pub const NONE: Self = Self(0);
    /// Do not spawn a server if none is running.
    pub const NOAUTOSPAWN: Self = Self(1);
    /// Keep waiting for a server to appear instead of failing.
    pub const NOFAIL: Self = Self(2);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContextFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Configuration for a connection context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfiguration {
    /// Descriptive application name announced to the server.
    pub application_name: String,

    /// Server address, or None for the default server.
    pub server: Option<String>,

    /// Connect flags (default: none).
    pub flags: ContextFlags,
}

impl ContextConfiguration {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_native_string("application name", &self.application_name)?;
        if let Some(server) = &self.server {
            validate_native_string("server", server)?;
        }
        Ok(())
    }
}

impl Default for ContextConfiguration {
    fn default() -> Self {
        Self {
            application_name: "pulse-bridge".into(),
            server: None,
            flags: ContextFlags::NONE,
        }
    }
}

/// Configuration for the threaded event loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MainloopConfiguration {
    /// Name given to the event-loop thread, or None to keep the native default.
    pub thread_name: Option<String>,
}

impl MainloopConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        match &self.thread_name {
            Some(name) => validate_native_string("thread name", name),
            None => Ok(()),
        }
    }
}

/// Strings handed to the native layer must be non-empty C strings.
pub(crate) fn validate_native_string(what: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} must not be empty", what));
    }
    if value.contains('\0') {
        return Err(format!("{} must not contain NUL bytes", what));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        assert!(ContextConfiguration::default().validate().is_ok());
        assert!(MainloopConfiguration::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_application_name() {
        let config = ContextConfiguration::new("");
        assert_eq!(
            config.validate(),
            Err("application name must not be empty".to_string())
        );
    }

    #[test]
    fn rejects_interior_nul() {
        let config = ContextConfiguration {
            server: Some("unix:/run/pulse\0native".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MainloopConfiguration {
            thread_name: Some("loop\0".into()),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn flags_combine() {
        let flags = ContextFlags::NOAUTOSPAWN | ContextFlags::NOFAIL;
        assert_eq!(flags.bits(), 3);
        assert!(flags.contains(ContextFlags::NOFAIL));
        assert!(!ContextFlags::NOAUTOSPAWN.contains(ContextFlags::NOFAIL));
    }
}
