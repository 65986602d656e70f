//! Command-line checks for the `sdrlib-station` binary.

use std::process::Command;

const STATION: &str = env!("CARGO_BIN_EXE_sdrlib-station");
const AIRSPY: &str = env!("CARGO_BIN_EXE_mock-airspy-tcp");

fn stdout(args: &[&str]) -> String {
    let output = Command::new(STATION).args(args).output().unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn encode_prints_the_command_frame() {
    assert_eq!(stdout(&["encode", "frequency", "166.376"]).trim(), "01 09 ea b2 40");
    assert_eq!(stdout(&["encode", "streaming", "1"]).trim(), "0f 00 00 00 01");
}

#[test]
fn encode_rejects_unknown_parameters() {
    let output = Command::new(STATION)
        .args(["encode", "volume", "3"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn params_lists_the_table() {
    let out = stdout(&["params"]);
    assert!(out.lines().any(|l| l.starts_with("frequency")));
    assert!(out.lines().any(|l| l.starts_with("streaming")));
}

#[test]
fn run_tunes_an_airspy_and_prints_its_settings() {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("plan.json");
    std::fs::write(&plan, r#"{"rate": 6000000, "params": {"frequency": 166.376}}"#).unwrap();

    let out = stdout(&[
        "run",
        "--kind",
        "airspy",
        "--usb-path",
        "1:4",
        "--port",
        "2",
        "--plan",
        plan.to_str().unwrap(),
        "--airspy-program",
        AIRSPY,
        "--socket-dir",
        dir.path().to_str().unwrap(),
        "--duration",
        "2",
    ]);
    assert!(out.lines().any(|l| l.starts_with("added ")), "{out}");
    assert!(
        out.lines()
            .any(|l| l.starts_with("settings port 2:") && l.contains(r#""frequency":166.376"#)),
        "{out}"
    );
    assert!(!dir.path().join("airspy-1:4.sock").exists());
}
