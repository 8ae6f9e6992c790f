use anyhow::Result;
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn init_creates_an_empty_repository() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo_path = repo_dir.path().join("repo");

    cli_run(&repo_path)?.arg("init").assert().success();

    assert!(repo_path.join("metadata").is_file());
    assert!(repo_path.join("00").join("00").is_dir());
    assert!(repo_path.join("ff").join("ff").is_dir());
    Ok(())
}

#[test]
fn init_refuses_an_existing_directory() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo_path = repo_dir.path().join("repo");

    cli_run(&repo_path)?.arg("init").assert().success();
    cli_run(&repo_path)?.arg("init").assert().failure();
    Ok(())
}

#[test]
fn backup_refuses_to_run_twice_concurrently() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo_path = repo_dir.path().join("repo");
    cli_run(&repo_path)?.arg("init").assert().success();

    // Leave the lockfile behind, simulating a still-running (or crashed)
    // concurrent invocation (§5 "Shared-resource policy").
    std::fs::write(repo_path.join("lockfile"), b"")?;

    let src_dir = tempdir()?;
    let config = write_config(src_dir.path(), &format!("[copy]\n{}\n", src_dir.path().join("a").display()))?;
    std::fs::write(src_dir.path().join("a"), b"hi")?;

    cli_run(&repo_path)?
        .arg("backup")
        .arg(&config)
        .assert()
        .failure();
    Ok(())
}
