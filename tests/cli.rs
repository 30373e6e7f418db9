use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

const HEX: &str = "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e";
const NPUB: &str = "npub10elfcs4fr0l0r8af98jlmgdh9c8tcxjvz9qkw038js35mp4dma8qzvjptg";

fn write_env(dir: &TempDir, extra: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "{extra}DB_PATH={}\nRELAY_URL=localhost\nRELAY_NAME=test\nRELAY_NPUB={NPUB}\nADMISSION_MODE=owner\n",
        dir.path().join("db").display(),
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap().trim().to_string()
}

#[test]
fn key_commands_convert_both_ways() {
    let npub = stdout(
        Command::cargo_bin("relaygate")
            .unwrap()
            .args(["key", "encode", HEX]),
    );
    assert_eq!(npub, NPUB);
    let hex = stdout(
        Command::cargo_bin("relaygate")
            .unwrap()
            .args(["key", "decode", NPUB]),
    );
    assert_eq!(hex, HEX);

    Command::cargo_bin("relaygate")
        .unwrap()
        .args(["key", "decode", "npub1notakey"])
        .assert()
        .failure();
}

#[test]
fn backup_cli_writes_engine_file() {
    for (engine, file) in [("redb", "relay.redb"), ("log", "events.log")] {
        let dir = TempDir::new().unwrap();
        let env_path = write_env(&dir, &format!("DB_ENGINE={engine}\n"));
        let dest = dir.path().join("backups");
        let written = stdout(
            Command::cargo_bin("relaygate")
                .unwrap()
                .env("RUST_LOG", "debug")
                .args(["--env", &env_path, "backup", "--dest", dest.to_str().unwrap()]),
        );
        assert_eq!(written, dest.join(file).display().to_string());
        assert!(dest.join(file).exists());
    }
}

#[test]
fn missing_required_settings_fail() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("env");
    fs::write(&env_path, "RELAY_URL=localhost\n").unwrap();
    Command::cargo_bin("relaygate")
        .unwrap()
        .env_remove("RELAY_NAME")
        .env_remove("RELAY_NPUB")
        .args(["--env", env_path.to_str().unwrap(), "backup", "--dest", "out"])
        .assert()
        .failure();
}

#[test]
fn cli_help_lists_commands() {
    let text = stdout(Command::cargo_bin("relaygate").unwrap().arg("--help"));
    for cmd in ["serve", "backup", "key", "--env"] {
        assert!(text.contains(cmd));
    }
    let text = stdout(Command::cargo_bin("relaygate").unwrap().args(["help", "key"]));
    assert!(text.contains("encode"));
    assert!(text.contains("decode"));
}
