//! Integration tests for `vmkit mkfs` and `vmkit inspect`

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde_json::Value;
use xshell::{cmd, Shell};

use crate::{get_vmkit_command, integration_test, run_vmkit};

fn utf8(p: std::path::PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(p).map_err(|p| eyre!("non-UTF-8 path {}", p.display()))
}

/// A small application tree: `bin/app`, `lib/libapp.so{,.1}`, `etc/app.conf`.
fn stage_tree(root: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(root.join("bin"))?;
    std::fs::create_dir_all(root.join("lib"))?;
    std::fs::create_dir_all(root.join("etc"))?;
    std::fs::write(root.join("bin/app"), vec![0x7f; 2000])?;
    std::fs::write(root.join("lib/libapp.so.1"), "elf")?;
    std::fs::write(root.join("etc/app.conf"), "port=8080\n")?;
    std::os::unix::fs::symlink(root.join("lib/libapp.so.1"), root.join("lib/libapp.so"))?;
    Ok(())
}

fn test_mkfs_json_report() -> Result<()> {
    let sh = Shell::new()?;
    let vmkit = get_vmkit_command()?;
    let src = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    stage_tree(src.path())?;
    let src_path = utf8(src.path().to_path_buf())?;
    let image = utf8(out.path().join("app.rofs"))?;

    let output = cmd!(sh, "{vmkit} mkfs {image} {src_path} --json").output()?;
    if !output.status.success() {
        return Err(eyre!(
            "vmkit mkfs failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let report: Value =
        serde_json::from_slice(&output.stdout).context("Failed to parse mkfs JSON output")?;

    // root + 3 dirs + 3 files + 1 symlink
    assert_eq!(report["inodes"], 8);
    assert_eq!(report["directory_entries"], 7);
    assert_eq!(report["symlinks"], 1);
    let size = report["size"]
        .as_u64()
        .ok_or_else(|| eyre!("missing size in {report}"))?;
    assert_eq!(size % 512, 0);
    assert_eq!(std::fs::metadata(&image)?.len(), size);
    assert!(report["digest"]
        .as_str()
        .is_some_and(|d| d.starts_with("sha256:")));
    Ok(())
}
integration_test!(test_mkfs_json_report);

fn test_inspect_lists_tree() -> Result<()> {
    let src = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    stage_tree(src.path())?;
    let src_path = utf8(src.path().to_path_buf())?;
    let image = utf8(out.path().join("app.rofs"))?;

    // Absolute host symlinks are rewritten under the mapped image prefix
    let map = format!("{src_path}:/opt/app");
    run_vmkit(&["mkfs", image.as_str(), src_path.as_str(), "--map", &map])?
        .ensure_success("vmkit mkfs")?;

    let inspect = run_vmkit(&["inspect", image.as_str(), "--json"])?;
    inspect.ensure_success("vmkit inspect")?;
    let report: Value = serde_json::from_str(&inspect.stdout)?;
    let entries = report["entries"]
        .as_array()
        .ok_or_else(|| eyre!("Expected entries array, got: {}", inspect.stdout))?;
    let paths: Vec<_> = entries.iter().filter_map(|e| e["path"].as_str()).collect();
    assert_eq!(
        paths,
        [
            "/",
            "/bin",
            "/bin/app",
            "/etc",
            "/etc/app.conf",
            "/lib",
            "/lib/libapp.so",
            "/lib/libapp.so.1"
        ]
    );
    assert_eq!(entries[0]["inode"], 1);
    assert_eq!(entries[2]["count"], 2000);
    assert_eq!(entries[6]["kind"], "symlink");
    assert_eq!(entries[6]["target"], "/opt/app/lib/libapp.so.1");
    assert_eq!(report["superblock"]["magic"], 0xDEAD_BEADu64);
    assert!(report.get("verified").is_none());

    let verify = run_vmkit(&["inspect", image.as_str(), "--verify", "--json"])?;
    verify.ensure_success("vmkit inspect --verify")?;
    let report: Value = serde_json::from_str(&verify.stdout)?;
    assert_eq!(report["verified"]["files"], 3);
    assert_eq!(report["verified"]["bytes"], 2000 + 3 + 10);

    // Table output mentions every path too
    let table = run_vmkit(&["inspect", image.as_str()])?;
    table.ensure_success("vmkit inspect")?;
    assert!(table.stdout.contains("/etc/app.conf"), "{}", table.stdout);
    Ok(())
}
integration_test!(test_inspect_lists_tree);

fn test_mkfs_reproducible() -> Result<()> {
    let src = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    stage_tree(src.path())?;
    let src_path = utf8(src.path().to_path_buf())?;
    let first = utf8(out.path().join("one.rofs"))?;
    let second = utf8(out.path().join("two.rofs"))?;
    for image in [&first, &second] {
        run_vmkit(&["mkfs", image.as_str(), src_path.as_str()])?.ensure_success("vmkit mkfs")?;
    }
    assert_eq!(std::fs::read(&first)?, std::fs::read(&second)?);
    Ok(())
}
integration_test!(test_mkfs_reproducible);

fn test_inspect_rejects_non_rofs() -> Result<()> {
    let td = tempfile::tempdir()?;
    let junk = utf8(td.path().join("junk.img"))?;
    std::fs::write(&junk, vec![0u8; 4096])?;
    let r = run_vmkit(&["inspect", junk.as_str()])?;
    assert!(!r.success(), "inspect of a zeroed file should fail");
    assert!(r.stderr.contains("bad magic"), "{}", r.stderr);
    Ok(())
}
integration_test!(test_inspect_rejects_non_rofs);
