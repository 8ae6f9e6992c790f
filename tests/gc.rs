use anyhow::Result;
use tempfile::tempdir;

mod common;
use common::*;

#[test]
fn gc_on_a_fresh_repository_reclaims_nothing() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo_path = repo_dir.path().join("repo");
    cli_run(&repo_path)?.arg("init").assert().success();

    cli_run(&repo_path)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicates::str::contains("0 content files removed"));
    Ok(())
}

#[test]
fn gc_keeps_content_still_referenced_by_track_history() -> Result<()> {
    let repo_dir = tempdir()?;
    let repo_path = repo_dir.path().join("repo");
    cli_run(&repo_path)?.arg("init").assert().success();

    let src_dir = tempdir()?;
    let file = src_dir.path().join("journal");
    std::fs::write(&file, vec![0x99u8; 4096])?;
    let config = write_config(src_dir.path(), &format!("[track]\n{}\n", file.display()))?;

    cli_run(&repo_path)?.arg("backup").arg(&config).assert().success();

    // Change the content so `track` keeps two history points, both
    // referencing distinct content files.
    std::fs::write(&file, vec![0x98u8; 4096])?;
    cli_run(&repo_path)?.arg("backup").arg(&config).assert().success();

    cli_run(&repo_path)?
        .arg("gc")
        .assert()
        .success()
        .stdout(predicates::str::contains("0 content files removed"));
    Ok(())
}
