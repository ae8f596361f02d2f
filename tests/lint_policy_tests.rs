#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for Stock Pit Sync.
//!
//! Verifies that Cargo.toml keeps the panic-free lint policy. If a test
//! fails, the manifest has drifted from the agreed-upon standards.
//!
//! All checks are synchronous filesystem reads — no network access or async
//! runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let contents = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    contents.parse().expect("Cargo.toml must be valid TOML")
}

const REQUIRED_DENY_LINTS: &[&str] = &[
    "unwrap_used",
    "expect_used",
    "panic",
    "todo",
    "unimplemented",
    "indexing_slicing",
];

#[test]
fn cargo_toml_has_all_panic_free_lints() {
    let manifest = manifest();
    let clippy = manifest
        .get("lints")
        .and_then(|l| l.get("clippy"))
        .and_then(|c| c.as_table())
        .expect("Cargo.toml must have a [lints.clippy] section");

    for lint in REQUIRED_DENY_LINTS {
        let level = clippy.get(*lint).and_then(|v| v.as_str());
        assert_eq!(
            level,
            Some("deny"),
            "Cargo.toml must set `{lint} = \"deny\"` in [lints.clippy]. \
             All panic-prone lints must be at deny level to enforce the \
             panic-free policy in library code."
        );
    }
}

#[test]
fn manifest_declares_msrv() {
    let manifest = manifest();
    let msrv = manifest
        .get("package")
        .and_then(|p| p.get("rust-version"))
        .and_then(|v| v.as_str());
    assert!(
        msrv.is_some(),
        "Cargo.toml must declare rust-version so downstream users see the MSRV."
    );
}

#[test]
fn websocket_channel_is_a_default_feature() {
    let manifest = manifest();
    let defaults = manifest
        .get("features")
        .and_then(|f| f.get("default"))
        .and_then(|d| d.as_array())
        .expect("Cargo.toml must declare default features");
    assert!(
        defaults
            .iter()
            .any(|v| v.as_str() == Some("channel-websocket")),
        "The channel-websocket feature must stay in the default set; \
         dropping it silently would break downstream default builds."
    );
}
