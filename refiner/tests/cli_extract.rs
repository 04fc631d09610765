//! CLI tests for `refiner extract` and `refiner init`.

use std::fs;
use std::process::Command;

use refiner::core::types::ExtractionResult;
use refiner::exit_codes;
use refiner::io::config::{RefinerConfig, load_config};

#[test]
fn extract_prints_valid_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let response = temp.path().join("response.txt");
    let build = temp.path().join("build.sh");
    fs::write(
        &response,
        "Done.\n<conclusion>Feed the chunk reader.</conclusion>\n<fuzz_target>int main() {}</fuzz_target>\n",
    )
    .expect("write response");
    fs::write(&build, "make").expect("write build");

    let output = Command::new(env!("CARGO_BIN_EXE_refiner"))
        .arg("extract")
        .arg(&response)
        .arg("--build-script")
        .arg(&build)
        .output()
        .expect("refiner extract");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let result: ExtractionResult = serde_json::from_slice(&output.stdout).expect("json");
    assert!(result.valid);
    assert_eq!(result.fuzz_target, "int main() {}");
    assert_eq!(result.build_script, "make");
    assert!(!result.build_script_changed);
}

#[test]
fn extract_without_conclusion_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let response = temp.path().join("response.txt");
    fs::write(&response, "<fuzz target>int main() {}</fuzz target>").expect("write response");

    let output = Command::new(env!("CARGO_BIN_EXE_refiner"))
        .arg("extract")
        .arg(&response)
        .output()
        .expect("refiner extract");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let result: ExtractionResult = serde_json::from_slice(&output.stdout).expect("json");
    assert!(!result.valid);
    assert_eq!(result.failure_reason.as_deref(), Some("malformed_conclusion"));
}

#[test]
fn init_writes_loadable_default_config() {
    let temp = tempfile::tempdir().expect("tempdir");

    let status = Command::new(env!("CARGO_BIN_EXE_refiner"))
        .current_dir(temp.path())
        .arg("init")
        .status()
        .expect("refiner init");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let cfg = load_config(&temp.path().join("refiner.toml")).expect("load");
    assert_eq!(cfg, RefinerConfig::default());
}

#[test]
fn render_rejects_item_with_missing_placeholders() {
    let temp = tempfile::tempdir().expect("tempdir");
    let item = temp.path().join("item.toml");
    fs::write(&item, "id = \"png\"\n\n[values]\nLANGUAGE = \"C\"\n").expect("write item");

    let output = Command::new(env!("CARGO_BIN_EXE_refiner"))
        .current_dir(temp.path())
        .arg("render")
        .arg(&item)
        .output()
        .expect("refiner render");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("FUZZ_TARGET"), "{stderr}");
}
