//! Session configuration: which system to run, which ROM to load, and how
//! to expose it (§3's ambient "session configuration" item). A direct,
//! much-slimmer descendant of the teacher's `ChipDescriptor`/`SystemManifest`
//! pair — this configures *which emulated system* to run and how to expose
//! it, not a peripheral memory map, since the GameBoy/Chip8 address maps are
//! fixed by hardware rather than configuration surface.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    Gameboy,
    Chip8,
}

impl std::str::FromStr for SystemKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gameboy" | "gb" => Ok(SystemKind::Gameboy),
            "chip8" | "chip-8" => Ok(SystemKind::Chip8),
            other => Err(ConfigError::UnknownSystemKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for SystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemKind::Gameboy => write!(f, "gameboy"),
            SystemKind::Chip8 => write!(f, "chip8"),
        }
    }
}

/// A session file's on-disk shape. Every field is optional so that a file
/// may supply a subset and let CLI flags (or defaults) fill in the rest.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub system: Option<SystemKind>,
    pub rom_path: Option<PathBuf>,
    pub debug_port: Option<u16>,
    pub scale: Option<u32>,
    pub trace: Option<bool>,
}

impl SessionFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_yaml::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

/// The fully-resolved settings a session runs with: `{system, rom_path,
/// debug_port, scale, trace}` (§3). Built by merging an optional
/// `SessionFile` with CLI flags, CLI flags winning wherever both are
/// supplied.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub system: SystemKind,
    pub rom_path: PathBuf,
    pub debug_port: Option<u16>,
    pub scale: u32,
    pub trace: bool,
}

impl SessionConfig {
    /// Layers `overrides` (values explicitly passed on the command line) on
    /// top of `base` (values read from an optional session file). Any field
    /// left unset by both sides falls back to the documented default, except
    /// `system` and `rom_path`, which are mandatory.
    pub fn merge(base: SessionFile, overrides: SessionFile) -> Result<Self, ConfigError> {
        let system = overrides.system.or(base.system).ok_or(ConfigError::MissingField("system"))?;
        let rom_path = overrides.rom_path.or(base.rom_path).ok_or(ConfigError::MissingField("rom_path"))?;
        let debug_port = overrides.debug_port.or(base.debug_port);
        let scale = overrides.scale.or(base.scale).unwrap_or(2);
        let trace = overrides.trace.or(base.trace).unwrap_or(false);

        Ok(SessionConfig { system, rom_path, debug_port, scale, trace })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown system kind {0:?} (expected \"gameboy\" or \"chip8\")")]
    UnknownSystemKind(String),

    #[error("missing required session field `{0}`")]
    MissingField(&'static str),

    #[error("could not read session file {path}")]
    Read { path: PathBuf, #[source] source: std::io::Error },

    #[error("could not parse session file {path}")]
    Parse { path: PathBuf, #[source] source: serde_yaml::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_file_values() {
        let base = SessionFile {
            system: Some(SystemKind::Gameboy),
            rom_path: Some(PathBuf::from("/roms/tetris.gb")),
            debug_port: Some(1234),
            scale: Some(2),
            trace: Some(false),
        };
        let overrides = SessionFile { debug_port: Some(9999), ..Default::default() };

        let merged = SessionConfig::merge(base, overrides).unwrap();
        assert_eq!(merged.debug_port, Some(9999));
        assert_eq!(merged.system, SystemKind::Gameboy);
        assert_eq!(merged.rom_path, PathBuf::from("/roms/tetris.gb"));
    }

    #[test]
    fn missing_system_and_rom_path_is_an_error() {
        let result = SessionConfig::merge(SessionFile::default(), SessionFile::default());
        assert!(result.is_err());
    }

    #[test]
    fn session_file_round_trips_through_yaml() {
        let yaml = "system: chip8\nrom_path: /roms/pong.ch8\ndebug_port: 1234\nscale: 4\n";
        let parsed: SessionFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.system, Some(SystemKind::Chip8));
        assert_eq!(parsed.debug_port, Some(1234));
    }

    #[test]
    fn unknown_system_kind_string_is_rejected() {
        assert!("amiga".parse::<SystemKind>().is_err());
        assert_eq!("gb".parse::<SystemKind>().unwrap(), SystemKind::Gameboy);
    }
}
