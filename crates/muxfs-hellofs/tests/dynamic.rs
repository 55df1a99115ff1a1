//! hellofs loaded from its built shared object.
//!
//! Cargo builds the `cdylib` next to the test binary (in `deps/`) and
//! copies it one level up; either location will do.

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::PathBuf;

use muxfs::{ErrorKind, MountConfig, MountableFs, VfsError};
use muxfs_hellofs::CONTENTS;

fn shared_object() -> PathBuf {
    let name = format!("{DLL_PREFIX}muxfs_hellofs{DLL_SUFFIX}");
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    [deps.join(&name), deps.parent().unwrap().join(&name)]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| panic!("{name} not found next to {}", exe.display()))
}

#[tokio::test]
async fn test_load_mount_read_unload() {
    let module = shared_object();
    let fs = MountableFs::new();

    let name = fs.load_plugin(&module).await.unwrap();
    assert_eq!(name, "hellofs");
    let loaded = fs.list_plugins();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, "hellofs");
    assert_eq!(loaded[0].path, module.canonicalize().unwrap());

    fs.mount("/hello", "hellofs", MountConfig::new()).await.unwrap();
    assert_eq!(fs.read("/hello/hello", 0, 1024).await.unwrap(), CONTENTS);
    let info = fs.stat("/hello/hello").await.unwrap();
    assert_eq!(info.size, CONTENTS.len() as u64);

    let err = fs.unload_plugin(&module).unwrap_err();
    assert!(matches!(err, VfsError::InUse(_)));

    fs.unmount("/hello").await.unwrap();
    fs.unload_plugin(&module).unwrap();
    assert!(fs.list_plugins().is_empty());
    assert!(!fs.plugin_types().contains(&"hellofs".to_string()));

    // Loadable again once released.
    assert_eq!(fs.load_plugin(&module).await.unwrap(), "hellofs");
}

#[tokio::test]
async fn test_second_load_is_already_registered() {
    let module = shared_object();
    let fs = MountableFs::new();
    fs.load_plugin(&module).await.unwrap();

    let err = fs.load_plugin(&module).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);

    // Same plugin name from a different file.
    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join(module.file_name().unwrap());
    std::fs::copy(&module, &copy).unwrap();
    let err = fs.load_plugin(&copy).await.unwrap_err();
    assert!(matches!(err, VfsError::AlreadyRegistered(ref name) if name == "hellofs"));

    assert_eq!(fs.list_plugins().len(), 1);
    fs.mount("/hello", "hellofs", MountConfig::new()).await.unwrap();
    assert_eq!(fs.read("/hello/hello", 0, 5).await.unwrap(), b"Hello");
}
