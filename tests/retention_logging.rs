//! Log output emitted while pruning.
//!
//! `logtest` installs a process-wide logger, so this binary holds a single
//! test.

use camino::Utf8PathBuf;
use log::Level;
use logtest::Logger;
use rulegate::catalog::JsonCatalog;
use rulegate::lifecycle::prune_releases;
use rulegate::release::{ArtifactType, NewRelease, ReleaseStatus};
use rulegate::store::{Pointer, Store};

#[test]
fn prune_warns_about_dangling_pointers_and_reports_progress() {
    let mut logger = Logger::start();
    let temp = tempfile::tempdir().expect("create temp dir");
    let store = Store::new(Utf8PathBuf::try_from(temp.path().to_path_buf()).expect("UTF-8 path"));
    store.ensure_dirs().expect("create store");
    let mut catalog = JsonCatalog::open(store.base_dir().join("catalog.json")).expect("open");

    for version in ["v1", "v2", "v3"] {
        let release_dir = store.release_dir(version);
        std::fs::create_dir_all(&release_dir).expect("create release dir");
        catalog
            .upsert(NewRelease {
                kind: "crs".to_owned(),
                version: version.to_owned(),
                artifact_type: ArtifactType::Zip,
                checksum: "cd".repeat(32),
                size_bytes: 10,
                storage_path: release_dir,
                status: ReleaseStatus::Verified,
            })
            .expect("upsert");
    }
    store
        .set_pointer(Pointer::LastGood, &store.release_dir("v0"))
        .expect("point last_good at a missing release");

    let report = prune_releases(&store, &mut catalog, "crs", 1).expect("prune");
    assert_eq!(report.dangling_pointers, vec![Pointer::LastGood]);
    assert_eq!(report.deleted.len(), 2);

    let mut warned = false;
    let mut summarised = false;
    while let Some(record) = logger.pop() {
        let message = record.args().to_string();
        match record.level() {
            Level::Warn if message.contains("last_good points at a release that no longer exists") => {
                warned = true;
            }
            Level::Info if message.contains("pruned 2 crs release(s), removed 2 director(ies)") => {
                summarised = true;
            }
            _ => {}
        }
    }
    assert!(warned, "expected a dangling pointer warning");
    assert!(summarised, "expected a prune summary");
}
