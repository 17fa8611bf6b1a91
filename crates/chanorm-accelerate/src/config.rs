use std::path::PathBuf;

pub const ENV_TUNING: &str = "CHANORM_TUNING";
pub const ENV_TUNING_DIR: &str = "CHANORM_TUNING_DIR";
pub const ENV_TUNING_PERSIST: &str = "CHANORM_TUNING_PERSIST";
pub const ENV_TUNING_TRIALS: &str = "CHANORM_TUNING_TRIALS";
pub const ENV_MAX_KERNEL_TIME_MS: &str = "CHANORM_MAX_KERNEL_TIME_MS";
pub const ENV_WGPU_FORCE_FALLBACK: &str = "CHANORM_WGPU_FORCE_FALLBACK";
pub const ENV_WGPU_POWER: &str = "CHANORM_WGPU_POWER";

pub const DEFAULT_TUNING_TRIALS: u32 = 3;

/// Parse a boolean switch. Unrecognised values are ignored with a warning.
pub fn env_flag(var: &str) -> Option<bool> {
    let raw = std::env::var(var).ok()?;
    parse_flag(&raw).or_else(|| {
        log::warn!("ignoring {var}={raw:?}: expected 1/true/yes/on or 0/false/no/off");
        None
    })
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Positive integer override; zero and garbage fall back to the default.
pub fn env_u32(var: &str) -> Option<u32> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            log::warn!("ignoring {var}={raw:?}: expected a positive integer");
            None
        }
    }
}

pub fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `CHANORM_TUNING_DIR`, else `<data_local_dir>/chanorm`.
pub fn tuning_base_dir() -> Option<PathBuf> {
    env_string(ENV_TUNING_DIR)
        .map(PathBuf::from)
        .or_else(|| dirs::data_local_dir().map(|dir| dir.join("chanorm")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for on in ["1", "true", " YES ", "On"] {
            assert_eq!(parse_flag(on), Some(true), "{on}");
        }
        for off in ["0", "false", "No", "off"] {
            assert_eq!(parse_flag(off), Some(false), "{off}");
        }
        assert_eq!(parse_flag("maybe"), None);
    }
}
