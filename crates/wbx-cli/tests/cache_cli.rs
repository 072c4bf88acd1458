use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;
use wbx_store::{DurableStore, FsStore};

fn wbx() -> std::process::Command {
    std::process::Command::new(assert_cmd::cargo::cargo_bin!("wbx"))
}

#[test]
fn cache_list_prints_stored_keys() {
    let tmp = TempDir::new().expect("tmpdir");
    let store = FsStore::open(tmp.path()).expect("store");
    store.write("5eb63bbbe01eeed093cb22bb8f5acdc3", b"libc").unwrap();
    store.write("0123456789abcdef0123456789abcdef", b"libm").unwrap();

    wbx()
        .args(["--store", tmp.path().to_str().unwrap(), "cache", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5eb63bbbe01eeed093cb22bb8f5acdc3"))
        .stdout(predicate::str::contains("0123456789abcdef0123456789abcdef"));
}

#[test]
fn cache_list_json_on_empty_store() {
    let tmp = TempDir::new().expect("tmpdir");
    let assert = wbx()
        .env("WBX_STORE", tmp.path())
        .args(["cache", "list", "--json"])
        .assert()
        .success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let keys: Vec<String> = serde_json::from_str(&output).expect("json");
    assert!(keys.is_empty());
}

#[test]
fn cache_clear_and_unlock() {
    let tmp = TempDir::new().expect("tmpdir");
    let store = FsStore::open(tmp.path()).expect("store");
    store.write("5eb63bbbe01eeed093cb22bb8f5acdc3", b"libc").unwrap();
    store.set_lock().unwrap();

    wbx()
        .args(["--store", tmp.path().to_str().unwrap(), "cache", "unlock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed stale lock"));
    assert!(!store.is_locked().unwrap());

    wbx()
        .args(["--store", tmp.path().to_str().unwrap(), "cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 1 entries"));
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn unreachable_assets_fail_startup() {
    let tmp = TempDir::new().expect("tmpdir");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    wbx()
        .args([
            "--store",
            tmp.path().to_str().unwrap(),
            "--base-url",
            &format!("http://{addr}/static_lib"),
            "run",
            "emcc",
            "-v",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fetch asset index"));
}
