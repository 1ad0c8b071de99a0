use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn fileson(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_fileson"))
        .args(args)
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run fileson")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_cli_scan_diff_and_versions() {
    let tmp = TempDir::new().unwrap();
    let tree = tmp.path().join("tree");
    fs::create_dir_all(tree.join("sub")).unwrap();
    fs::write(tree.join("a.txt"), "alpha").unwrap();
    fs::write(tree.join("sub/b.txt"), "beta").unwrap();
    let db = tmp.path().join("tree.fson");

    let output = fileson(&["scan", arg(&db), arg(&tree)]);
    assert!(output.status.success(), "scan failed: {:?}", output);
    assert!(stdout(&output).contains("Scan 1 complete"));

    fs::write(tree.join("c.txt"), "gamma").unwrap();
    fs::remove_file(tree.join("a.txt")).unwrap();

    // Directory defaults to the one recorded in the catalog
    let output = fileson(&["scan", arg(&db)]);
    assert!(output.status.success(), "rescan failed: {:?}", output);

    let old = format!("{}~1", arg(&db));
    let output = fileson(&["diff", &old, arg(&db)]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("+ c.txt"), "unexpected diff: {}", text);
    assert!(text.contains("- a.txt"), "unexpected diff: {}", text);

    let output = fileson(&["diff", &old, arg(&db), "--json"]);
    let deltas: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(deltas.as_array().unwrap().len(), 2);

    let copy = tmp.path().join("first.fson");
    assert!(fileson(&["copy", &old, arg(&copy)]).status.success());
    let output = fileson(&["show", arg(&copy)]);
    assert!(stdout(&output).contains("a.txt"));

    // Refuses to clobber without --force
    assert!(!fileson(&["copy", &old, arg(&copy)]).status.success());
    assert!(fileson(&["copy", &old, arg(&copy), "--force"]).status.success());

    let output = fileson(&["stats", arg(&db), "--history"]);
    let text = stdout(&output);
    assert!(text.contains("Files: 2"), "unexpected stats: {}", text);
    assert!(text.contains(":scan:"));
}

#[test]
fn test_cli_backup_restore_with_key() {
    let tmp = TempDir::new().unwrap();
    let tree = tmp.path().join("tree");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("one.txt"), "one").unwrap();
    fs::write(tree.join("dup.txt"), "one").unwrap();
    let db = tmp.path().join("tree.fson");
    let log = tmp.path().join("tree.log");
    let dest = tmp.path().join("dest");
    let target = tmp.path().join("restored");

    let output = fileson(&["keygen", "secret", "pepper", "-i", "1k"]);
    assert!(output.status.success());
    let key = stdout(&output).trim().to_string();
    assert_eq!(key.len(), 64);
    let key_file = tmp.path().join("tree.key");
    fs::write(&key_file, &key).unwrap();

    assert!(fileson(&["scan", arg(&db), arg(&tree)]).status.success());

    let output = fileson(&["backup", arg(&db), arg(&log), arg(&dest), "-k", arg(&key_file), "--simulate"]);
    assert!(stdout(&output).contains("1 files to back up"), "{}", stdout(&output));
    assert!(!dest.exists());

    let output = fileson(&["backup", arg(&db), arg(&log), arg(&dest), "-k", arg(&key_file)]);
    assert!(output.status.success(), "backup failed: {:?}", output);

    // Without a key the stored catalogs cannot be read
    assert!(!fileson(&["restore", arg(&dest), arg(&target)]).status.success());

    let output = fileson(&["restore", arg(&dest), arg(&target), "-k", &key]);
    assert!(output.status.success(), "restore failed: {:?}", output);
    assert_eq!(fs::read_to_string(target.join("dup.txt")).unwrap(), "one");

    let output = fileson(&["check-tags", arg(&log), arg(&dest)]);
    assert!(stdout(&output).contains("1/1 blobs ok"), "{}", stdout(&output));
}

#[test]
fn test_cli_backup_destination_selection() {
    let tmp = TempDir::new().unwrap();
    let tree = tmp.path().join("tree");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("a.txt"), "a").unwrap();
    let db = tmp.path().join("tree.fson");
    let log = tmp.path().join("tree.log");
    assert!(fileson(&["scan", arg(&db), arg(&tree)]).status.success());

    let output = fileson(&["backup", arg(&db), arg(&log), "s3:///no-bucket"]);
    assert!(!output.status.success());
    assert!(!log.exists());

    // A storage class has no meaning for a directory; the backup still runs.
    let dest = tmp.path().join("dest");
    let output = fileson(&["backup", arg(&db), arg(&log), arg(&dest), "--deep-archive"]);
    assert!(output.status.success(), "backup failed: {:?}", output);
    assert!(String::from_utf8_lossy(&output.stderr).contains("Storage classes only apply"));
    assert!(dest.join("fileson.fson").exists());
}

#[test]
fn test_cli_encrypt_decrypt_and_etag() {
    let tmp = TempDir::new().unwrap();
    let plain = tmp.path().join("plain.bin");
    let sealed = tmp.path().join("sealed.bin");
    let opened = tmp.path().join("opened.bin");
    fs::write(&plain, vec![7u8; 100_000]).unwrap();

    let key = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    let iv = "000102030405060708090a0b0c0d0e0f";
    assert!(fileson(&["encrypt", arg(&plain), arg(&sealed), key, "--iv", iv]).status.success());
    assert_eq!(fs::metadata(&sealed).unwrap().len(), 100_016);
    assert!(fileson(&["decrypt", arg(&sealed), arg(&opened), key]).status.success());
    assert_eq!(fs::read(&opened).unwrap(), fs::read(&plain).unwrap());

    // Tag of the encrypted form computed on the fly equals the tag of the file
    let direct = stdout(&fileson(&["etag", arg(&sealed), "-p", "65536"]));
    let on_the_fly = stdout(&fileson(&["etag", arg(&plain), "-p", "65536", "-k", key, "--iv", iv]));
    assert_eq!(direct.trim(), on_the_fly.trim());
    assert!(direct.trim().ends_with("-2"), "unexpected tag {}", direct);
}
