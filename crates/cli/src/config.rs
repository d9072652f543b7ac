//! solis.toml configuration
//!
//! Optional host-side configuration mapped onto the library's
//! `VmOptions`. A `--config` path must exist; otherwise `./solis.toml`
//! is used when present and silently skipped when not. Environment
//! variables still override everything (see `VmOptions::from_env`).
//!
//! ```toml
//! [vm]
//! sandboxed = false
//! gc_stress = false
//! gc_log = false
//! trace = false
//! ```

use std::path::Path;

use serde::Deserialize;
use solis::VmOptions;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Config {
    vm: VmSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VmSection {
    sandboxed: bool,
    gc_stress: bool,
    gc_log: bool,
    trace: bool,
}

fn parse(text: &str, origin: &Path) -> Result<VmOptions, String> {
    let config: Config =
        toml::from_str(text).map_err(|err| format!("{}: {err}", origin.display()))?;
    Ok(VmOptions {
        sandboxed: config.vm.sandboxed,
        gc_stress: config.vm.gc_stress,
        gc_log: config.vm.gc_log,
        trace: config.vm.trace,
    })
}

/// Load options from an explicit config path, or from `./solis.toml`
/// when one exists.
pub fn load(path: Option<&Path>) -> Result<VmOptions, String> {
    let (text, origin) = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| format!("{}: {err}", path.display()))?;
            (text, path.to_path_buf())
        }
        None => {
            let default = Path::new("solis.toml");
            match std::fs::read_to_string(default) {
                Ok(text) => (text, default.to_path_buf()),
                Err(_) => return Ok(VmOptions::default()),
            }
        }
    };
    parse(&text, &origin)
}
