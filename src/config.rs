//! Ambient, non-algorithmic configuration: cache/IO sizing knobs loaded
//! from `~/.config/packrat.toml`. Distinct from the search-tree config
//! (§4.2, `search::from_config`), which is the repository-selection
//! policy text and is always passed explicitly, never read from `$HOME`.

use std::{fs, io};

use anyhow::{anyhow, Context, Result};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde::Deserialize;

#[inline]
fn default_read_block_size() -> Byte {
    Byte::from_u64(64 * 1024)
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Block size used when streaming a file through the hasher (C4) and
    /// through repository writes (C5). Exposed as a knob because it's a
    /// pure performance tuning parameter with no effect on the on-disk
    /// format or any invariant.
    #[serde(default = "default_read_block_size")]
    pub read_block_size: Byte,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            read_block_size: default_read_block_size(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "packrat.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
