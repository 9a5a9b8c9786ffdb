use std::sync::Mutex;

use httpmock::prelude::*;
use sha2::{Digest, Sha256};
use stem_pipeline::{
    model::model_manager::ensure_model_in, NoProgress, StemError,
};

const WEIGHTS: &[u8] = b"not really an onnx graph, but the bytes are what count";

fn manifest(server: &MockServer, sha: &str) -> serde_json::Value {
    serde_json::json!({
        "name": "htdemucs_ort_v1",
        "version": "1",
        "sample_rate_hz": 44100,
        "window": 343980,
        "hop": 171990,
        "stems": ["drums", "bass", "other", "vocals"],
        "entry": "htdemucs.onnx",
        "artifacts": [{
            "file": "htdemucs.onnx",
            "sha256": sha,
            "size_bytes": WEIGHTS.len(),
            "url": server.url("/htdemucs.onnx"),
        }],
    })
}

fn sha_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[test]
fn downloads_verifies_and_caches() {
    let server = MockServer::start();
    let sha = sha_hex(WEIGHTS);
    let manifest_mock = server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(200).json_body(manifest(&server, &sha));
    });
    let weights_mock = server.mock(|when, then| {
        when.method(GET).path("/htdemucs.onnx");
        then.status(200).body(WEIGHTS);
    });

    let cache = tempfile::tempdir().unwrap();
    let url = server.url("/manifest.json");

    let seen = Mutex::new(Vec::new());
    let sink = |f: f64| seen.lock().unwrap().push(f);
    let handle = ensure_model_in(cache.path(), "htdemucs_ort_v1", Some(&url), &sink).unwrap();

    assert_eq!(
        handle.local_path.file_name().unwrap().to_str().unwrap(),
        format!("htdemucs_ort_v1-{}.onnx", &sha[..8])
    );
    assert_eq!(std::fs::read(&handle.local_path).unwrap(), WEIGHTS);
    assert_eq!(handle.manifest.sample_rate, 44100);
    assert_eq!(seen.lock().unwrap().last(), Some(&1.0));

    // second call finds the verified file and skips the artifact
    ensure_model_in(cache.path(), "htdemucs_ort_v1", Some(&url), &NoProgress).unwrap();
    manifest_mock.assert_hits(2);
    weights_mock.assert_hits(1);
}

#[test]
fn checksum_mismatch_is_rejected_and_removed() {
    let server = MockServer::start();
    let wrong = "0".repeat(64);
    server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(200).json_body(manifest(&server, &wrong));
    });
    server.mock(|when, then| {
        when.method(GET).path("/htdemucs.onnx");
        then.status(200).body(WEIGHTS);
    });

    let cache = tempfile::tempdir().unwrap();
    let url = server.url("/manifest.json");
    let err = ensure_model_in(cache.path(), "htdemucs_ort_v1", Some(&url), &NoProgress).unwrap_err();

    assert!(matches!(err, StemError::Checksum { .. }));
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[test]
fn missing_manifest_is_an_http_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(404);
    });

    let cache = tempfile::tempdir().unwrap();
    let url = server.url("/manifest.json");
    let err = ensure_model_in(cache.path(), "htdemucs_ort_v1", Some(&url), &NoProgress).unwrap_err();
    assert!(matches!(err, StemError::Http(_)));
}
