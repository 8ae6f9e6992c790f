#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;

/// Build a `packrat --repository <repo> -- <subcommand...>` invocation.
pub fn cli_run(repo_path: &Path) -> Result<Command> {
    let bin_name = env!("CARGO_PKG_NAME");
    let mut cmd = Command::cargo_bin(bin_name)?;
    cmd.arg("--repository").arg(repo_path);
    Ok(cmd)
}

/// Write a policy-tree config file (§4.2) under `dir`, returning its path.
pub fn write_config(dir: &Path, text: &str) -> Result<std::path::PathBuf> {
    let path = dir.join("config");
    std::fs::write(&path, text)?;
    Ok(path)
}
