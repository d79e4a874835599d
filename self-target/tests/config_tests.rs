// tests/config_tests.rs

use std::{io::Write, path::Path, time::Duration};

use tempfile::NamedTempFile;

use self_target::config::{ConfigError, load};
use self_target::dispatch::Dispatcher;
use self_target::{Access, Device, SelfTarget, SelfTargetError};

#[test]
fn bundled_config_loads() {
    let cfg = load(&Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml")).unwrap();
    assert_eq!(cfg.logging.level, "DEBUG");
    assert_eq!(cfg.engine.worker_threads, 2);
    assert_eq!(cfg.engine.queue_depth, 64);
    assert_eq!(cfg.target.share_access(), Access::READ_WRITE);
    assert_eq!(cfg.request.default_timeout, Duration::from_secs(5));
}

#[test]
fn zero_queue_depth_is_rejected_on_load() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[engine]\nworker_threads = 1\nqueue_depth = 0").unwrap();
    let err = load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { field: "engine.queue_depth", .. }));
}

#[test]
fn non_shared_target_conflicts_with_other_openers() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[target]\nshare_read = false\nshare_write = false").unwrap();
    let cfg = load(file.path()).unwrap();

    let dev = Device::new("cfg-share", Dispatcher::new());
    let _other = dev.open_handle(Access::READ, Access::READ_WRITE).unwrap();
    let st = SelfTarget::create(&dev, &cfg).unwrap();
    assert!(matches!(st.open(&dev), Err(SelfTargetError::OpenFailure(_))));
}
