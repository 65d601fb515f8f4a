//! Editor selection.
//!
//! ```toml
//! backend = "tracer"
//! grant-ptracer = false
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::editor::{DynEditor, Unsupported};
use crate::error::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Whatever the build platform provides.
    Native,
    Tracer,
    Handshake,
    Unsupported,
}

impl Default for Backend {
    fn default() -> Self {
        Self::Native
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub backend: Backend,
    /// Name the tracer child as our ptracer before it attaches (Yama).
    pub grant_ptracer: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            grant_ptracer: true,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let config = Self::from_toml(&fs::read_to_string(path)?)?;

        debug!(path = %path.display(), backend = ?config.backend, "loaded configuration");
        Ok(config)
    }

    /// Builds the configured editor; fails if this platform lacks it.
    pub fn editor(&self) -> Result<DynEditor, Error> {
        match self.backend {
            Backend::Native => self.tracer().or_else(|_| self.handshake()),
            Backend::Tracer => self.tracer(),
            Backend::Handshake => self.handshake(),
            Backend::Unsupported => Ok(Box::new(Unsupported)),
        }
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
    fn tracer(&self) -> Result<DynEditor, Error> {
        Ok(Box::new(crate::editor::tracer::TracerEditor::new(
            self.grant_ptracer,
        )))
    }

    #[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
    fn tracer(&self) -> Result<DynEditor, Error> {
        Err(Error::PlatformUnsupported)
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    fn handshake(&self) -> Result<DynEditor, Error> {
        use crate::editor::handshake::HandshakeEditor;
        use crate::editor::windows::WindowsThreads;

        Ok(Box::new(HandshakeEditor::new(WindowsThreads)))
    }

    #[cfg(not(all(windows, target_arch = "x86_64")))]
    fn handshake(&self) -> Result<DynEditor, Error> {
        Err(Error::PlatformUnsupported)
    }
}
