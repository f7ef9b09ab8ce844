//! Unit tests for package extraction.

use super::*;
use crate::test_utils::{ArchiveEntry, write_tar_gz, write_zip};
use rstest::rstest;

struct Sandbox {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).expect("UTF-8 path");
        Self { _temp: temp, root }
    }

    fn package(&self, kind: PackageKind, entries: &[ArchiveEntry<'_>]) -> Utf8PathBuf {
        let path = self.root.join(format!("pkg{}", kind.extension()));
        match kind {
            PackageKind::TarGz => write_tar_gz(path.as_std_path(), entries),
            PackageKind::Zip => write_zip(path.as_std_path(), entries),
        }
        path
    }

    fn target(&self) -> Utf8PathBuf {
        self.root.join("out")
    }

    fn extract(
        &self,
        kind: PackageKind,
        entries: &[ArchiveEntry<'_>],
        options: ExtractOptions,
    ) -> Result<ExtractionSummary, ExtractionError> {
        let package = self.package(kind, entries);
        ArchiveExtractor.extract(&package, kind, &self.target(), &options)
    }
}

fn kinds() -> [PackageKind; 2] {
    PackageKind::ALL
}

#[rstest]
#[case(PackageKind::TarGz)]
#[case(PackageKind::Zip)]
fn extracts_files_and_directories(#[case] kind: PackageKind) {
    let sandbox = Sandbox::new();
    let entries = [
        ArchiveEntry::Dir("rules/"),
        ArchiveEntry::File("rules/REQUEST-901.conf", b"SecRule ARGS"),
        ArchiveEntry::File("./crs-setup.conf", b"SecAction"),
    ];

    let summary = sandbox
        .extract(kind, &entries, ExtractOptions::default())
        .expect("extract");

    assert_eq!(summary.file_count, 2);
    assert_eq!(summary.total_bytes, 21);
    assert_eq!(summary.extract_path, sandbox.target());
    let written = fs::read(sandbox.target().join("rules/REQUEST-901.conf")).expect("read rule");
    assert_eq!(written, b"SecRule ARGS");
    assert!(sandbox.target().join("crs-setup.conf").is_file());
}

#[rstest]
#[case::parent("../evil.conf")]
#[case::nested_parent("rules/../../evil.conf")]
fn rejects_traversal_without_writing(#[case] name: &str) {
    for kind in kinds() {
        let sandbox = Sandbox::new();
        let entries = [
            ArchiveEntry::File(name, b"pwned"),
            ArchiveEntry::File("after.conf", b"never"),
        ];

        let err = sandbox
            .extract(kind, &entries, ExtractOptions::default())
            .expect_err("traversal rejected");

        assert!(
            matches!(err, ExtractionError::PathTraversal { .. }),
            "{kind}: {err:?}"
        );
        assert!(!sandbox.root.join("evil.conf").exists());
        assert!(!sandbox.target().join("after.conf").exists());
    }
}

#[test]
fn rejects_absolute_entries() {
    for kind in kinds() {
        let sandbox = Sandbox::new();
        let entries = [ArchiveEntry::File("/tmp/evil.conf", b"pwned")];

        let err = sandbox
            .extract(kind, &entries, ExtractOptions::default())
            .expect_err("absolute rejected");

        assert!(
            matches!(err, ExtractionError::AbsolutePath { .. }),
            "{kind}: {err:?}"
        );
    }
}

#[test]
fn rejects_backslash_traversal_in_zip() {
    let sandbox = Sandbox::new();
    let entries = [ArchiveEntry::File("..\\evil.conf", b"pwned")];

    let err = sandbox
        .extract(PackageKind::Zip, &entries, ExtractOptions::default())
        .expect_err("traversal rejected");

    assert!(matches!(err, ExtractionError::PathTraversal { .. }));
}

#[rstest]
#[case(PackageKind::TarGz)]
#[case(PackageKind::Zip)]
fn rejects_symlink_entries(#[case] kind: PackageKind) {
    let sandbox = Sandbox::new();
    let entries = [ArchiveEntry::Symlink("passwd", "/etc/passwd")];

    let err = sandbox
        .extract(kind, &entries, ExtractOptions::default())
        .expect_err("symlink rejected");

    assert!(matches!(err, ExtractionError::LinkEntry { .. }));
    assert!(fs::symlink_metadata(sandbox.target().join("passwd")).is_err());
}

#[test]
fn rejects_hard_link_entries() {
    let sandbox = Sandbox::new();
    let entries = [
        ArchiveEntry::File("a.conf", b"x"),
        ArchiveEntry::HardLink("b.conf", "a.conf"),
    ];

    let err = sandbox
        .extract(PackageKind::TarGz, &entries, ExtractOptions::default())
        .expect_err("hard link rejected");

    assert!(matches!(err, ExtractionError::LinkEntry { .. }));
}

#[rstest]
#[case(PackageKind::TarGz)]
#[case(PackageKind::Zip)]
fn enforces_file_cap(#[case] kind: PackageKind) {
    let sandbox = Sandbox::new();
    let entries = [
        ArchiveEntry::File("1.conf", b"a"),
        ArchiveEntry::File("2.conf", b"b"),
        ArchiveEntry::File("3.conf", b"c"),
    ];
    let options = ExtractOptions {
        max_files: 2,
        ..ExtractOptions::default()
    };

    let err = sandbox.extract(kind, &entries, options).expect_err("cap");

    assert!(matches!(err, ExtractionError::TooManyFiles { count: 3, max: 2 }));
}

#[rstest]
#[case(PackageKind::TarGz)]
#[case(PackageKind::Zip)]
fn byte_overrun_is_bounded_to_one_byte(#[case] kind: PackageKind) {
    let sandbox = Sandbox::new();
    let big = vec![b'x'; 4096];
    let entries = [
        ArchiveEntry::File("small.conf", b"1234"),
        ArchiveEntry::File("big.conf", &big),
    ];
    let options = ExtractOptions {
        max_total_bytes: 10,
        ..ExtractOptions::default()
    };

    let err = sandbox.extract(kind, &entries, options).expect_err("cap");

    assert!(matches!(err, ExtractionError::TooManyBytes { total: 11, max: 10 }));
    let partial = fs::metadata(sandbox.target().join("big.conf")).expect("partial file");
    assert_eq!(partial.len(), 7);
}

#[test]
fn skips_special_tar_entries() {
    let sandbox = Sandbox::new();
    let entries = [
        ArchiveEntry::Fifo("pipe"),
        ArchiveEntry::File("rule.conf", b"ok"),
    ];

    let summary = sandbox
        .extract(PackageKind::TarGz, &entries, ExtractOptions::default())
        .expect("extract");

    assert_eq!(summary.file_count, 1);
    assert!(!sandbox.target().join("pipe").exists());
}

#[test]
fn corrupt_zip_reports_zip_error() {
    let sandbox = Sandbox::new();
    let package = sandbox.root.join("broken.zip");
    fs::write(&package, b"not a zip").expect("write");

    let err = ArchiveExtractor
        .extract(
            &package,
            PackageKind::Zip,
            &sandbox.target(),
            &ExtractOptions::default(),
        )
        .expect_err("corrupt");

    assert!(matches!(err, ExtractionError::Zip { .. }));
}

#[rstest]
#[case::empty("", true)]
#[case::blank("  ", true)]
#[case::current_dir("./", false)]
fn handles_degenerate_names(#[case] name: &str, #[case] rejected: bool) {
    let result = resolve_entry(Path::new("/srv/out"), name);
    assert_eq!(result.is_err(), rejected, "{name:?}: {result:?}");
    if !rejected {
        assert_eq!(result.expect("accepted"), None);
    }
}

#[test]
fn resolves_nested_names_inside_target() {
    let resolved = resolve_entry(Path::new("/srv/out"), "a/./b/../c.conf").expect("valid");
    assert_eq!(resolved, Some(PathBuf::from("/srv/out/a/c.conf")));
}
