//! Verification Integration Tests
//!
//! Tests for the read-only verify pass: version reporting, match verdicts,
//! and the guarantee that verification never modifies the package.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use nupkg_promote::archive;
use nupkg_promote::mock::AssemblyBuilder;
use nupkg_promote::pipeline::Verifier;

/// Build a package with one binary per (platform, name, version) triple.
fn make_package(dir: &Path, id: &str, binaries: &[(&str, &str, &str)]) -> PathBuf {
    let staging = dir.join("staging");
    fs::create_dir_all(&staging).unwrap();
    fs::write(
        staging.join(format!("{id}.nuspec")),
        format!("<package><metadata><id>{id}</id><version>1.3.0</version></metadata></package>"),
    )
    .unwrap();
    for (platform, name, version) in binaries {
        let platform_dir = staging.join("lib").join(platform);
        fs::create_dir_all(&platform_dir).unwrap();
        AssemblyBuilder::new(name)
            .informational_version(version)
            .write_to(&platform_dir.join(format!("{name}.dll")))
            .unwrap();
    }

    let package = dir.join(format!("{id}.1.3.0.nupkg"));
    archive::build(&staging, &package).unwrap();
    fs::remove_dir_all(&staging).unwrap();
    package
}

#[test]
fn test_verify_reports_every_product_binary() {
    let dir = TempDir::new().unwrap();
    let package = make_package(
        dir.path(),
        "Couchbase.Lite",
        &[
            ("net45", "Couchbase.Lite", "1.3.0"),
            ("xamarinios10", "Couchbase.Lite", "1.3.0"),
            ("net45", "Newtonsoft.Json", "12.0.1"),
        ],
    );

    let verifier = Verifier::new().with_workspace(dir.path().join("ws"));
    let reports = verifier.verify(&package, None).unwrap();

    // third-party binaries are not reported
    let mut paths: Vec<String> =
        reports.iter().map(|r| r.path.to_string_lossy().into_owned()).collect();
    paths.sort();
    assert_eq!(paths, vec!["lib/net45/Couchbase.Lite.dll", "lib/xamarinios10/Couchbase.Lite.dll"]);
    assert!(reports.iter().all(|r| r.version == "1.3.0"));
    assert!(reports.iter().all(|r| r.matches.is_none()));
}

#[test]
fn test_verify_match_verdicts() {
    let dir = TempDir::new().unwrap();
    let package = make_package(dir.path(), "Couchbase.Lite", &[("net45", "Couchbase.Lite", "1.3.0")]);

    let verifier = Verifier::new().with_workspace(dir.path().join("ws"));

    let reports = verifier.verify(&package, Some("1.3.0")).unwrap();
    assert_eq!(reports[0].matches, Some(true));

    let reports = verifier.verify(&package, Some("1.3.1")).unwrap();
    assert_eq!(reports[0].matches, Some(false));
}

#[test]
fn test_verify_leaves_package_untouched() {
    let dir = TempDir::new().unwrap();
    let package = make_package(dir.path(), "Couchbase.Lite", &[("net45", "Couchbase.Lite", "1.3.0")]);
    let before = fs::read(&package).unwrap();

    let verifier = Verifier::new().with_workspace(dir.path().join("ws"));
    verifier.verify(&package, Some("9.9.9")).unwrap();

    assert_eq!(fs::read(&package).unwrap(), before);
    assert!(!dir.path().join("ws").exists(), "workspace must be cleaned up");
}
