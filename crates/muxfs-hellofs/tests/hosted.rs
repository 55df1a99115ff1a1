//! hellofs hosted by a `MountableFs` through the plugin loader.
//!
//! The declaration is linked in statically; the loader validates and
//! registers it exactly as it would one read from a shared object.

use muxfs::{ErrorKind, MountConfig, MountableFs, VfsError, WriteFlags};
use muxfs_hellofs::{CONTENTS, MUXFS_PLUGIN_DECLARATION};

const ORIGIN: &str = "static:hellofs";

async fn hosted() -> MountableFs {
    let fs = MountableFs::new();
    let name = fs
        .load_static_plugin(&MUXFS_PLUGIN_DECLARATION, ORIGIN)
        .await
        .unwrap();
    assert_eq!(name, "hellofs");
    fs
}

#[tokio::test]
async fn test_mount_and_read() {
    let fs = hosted().await;
    fs.mount("/hello", "hellofs", MountConfig::new()).await.unwrap();

    let names: Vec<_> = fs
        .read_dir("/hello")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["hello"]);
    assert_eq!(fs.read("/hello/hello", 0, 1024).await.unwrap(), CONTENTS);

    let err = fs
        .write("/hello/hello", b"bye", 0, WriteFlags::empty())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn test_listed_as_loaded() {
    let fs = hosted().await;
    let loaded = fs.list_plugins();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].name, "hellofs");
    assert!(fs.plugin_types().contains(&"hellofs".to_string()));
}

#[tokio::test]
async fn test_unload_refused_while_mounted() {
    let fs = hosted().await;
    fs.mount("/hello", "hellofs", MountConfig::new()).await.unwrap();

    let err = fs.unload_plugin(ORIGIN).unwrap_err();
    assert!(matches!(err, VfsError::InUse(_)));

    fs.unmount("/hello").await.unwrap();
    fs.unload_plugin(ORIGIN).unwrap();
    assert!(fs.list_plugins().is_empty());

    let err = fs
        .mount("/hello", "hellofs", MountConfig::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::UnknownPluginType(_)));
}

#[tokio::test]
async fn test_loading_twice() {
    let fs = hosted().await;
    let err = fs
        .load_static_plugin(&MUXFS_PLUGIN_DECLARATION, ORIGIN)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);

    let err = fs
        .load_static_plugin(&MUXFS_PLUGIN_DECLARATION, "static:hellofs-again")
        .await
        .unwrap_err();
    assert!(matches!(err, VfsError::AlreadyRegistered(ref name) if name == "hellofs"));
}
