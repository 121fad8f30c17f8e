//! Integration tests for fusecap

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn fusecap(config_dir: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("fusecap");
        cmd.env("FUSECAP_CONFIG", config_dir.join("config.toml"));
        cmd.env_remove("FUSECAP_NO_CACHE_RESTORE");
        cmd
    }

    const SCENARIO: &str = r#"
start = 1700000000
unreachable = ["u3"]
paths = { "10" = "d:/eos/home/", "11" = "f:/eos/home/notes.txt" }

[[steps]]
op = "store"
auth_id = "A1"
inode = 10
client_id = "c1"
client_uuid = "u1"

[[steps]]
op = "store"
auth_id = "B1"
inode = 10
client_id = "c2"
client_uuid = "u2"
lease_secs = 30

[[steps]]
op = "store"
auth_id = "C1"
inode = 10
client_id = "c3"
client_uuid = "u3"

[[steps]]
op = "imply"
inode = 11
source = "A1"
implied = "A2"

[[steps]]
op = "release"
auth_id = "A1"
client_uuid = "u1"

[[steps]]
op = "cache_create"
inode = 42
owner_lifetime_secs = 60

[[steps]]
op = "cache_write"
inode = 42
data = "hello"

[[steps]]
op = "cache_close"
inode = 42
"#;

    fn write_scenario(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("scenario.toml");
        std::fs::write(&path, SCENARIO).unwrap();
        path
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Capability leases"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("fusecap"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_defaults() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[caps]"))
            .stdout(predicate::str::contains("default_lease_secs = 300"));
    }

    #[test]
    fn config_set_persists() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .args(["config", "set", "restore.attempts", "5"])
            .assert()
            .success();

        let saved = std::fs::read_to_string(temp.path().join("config.toml")).unwrap();
        assert!(saved.contains("attempts = 5"));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .args(["config", "set", "caps.nope", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn replay_prints_notifications_and_dump() {
        let temp = TempDir::new().unwrap();
        let scenario = write_scenario(&temp);

        fusecap(temp.path())
            .arg("replay")
            .arg(&scenario)
            .assert()
            .success()
            .stdout(predicate::str::contains("attempted=2 delivered=1 failed=1"))
            .stdout(predicate::str::contains("-> release i:000000000000000a u:u2"))
            .stdout(predicate::str::contains("a:A2"))
            .stdout(predicate::str::contains("lease until 1700000060"));
    }

    #[test]
    fn replay_path_view_with_filter() {
        let temp = TempDir::new().unwrap();
        let scenario = write_scenario(&temp);

        fusecap(temp.path())
            .arg("replay")
            .arg(&scenario)
            .args(["--view", "path", "--filter", "NOTES"])
            .assert()
            .success()
            .stdout(predicate::str::contains("# f:/eos/home/notes.txt"))
            .stdout(predicate::str::contains("# d:/eos/home/").not());
    }

    #[test]
    fn replay_json_output() {
        let temp = TempDir::new().unwrap();
        let scenario = write_scenario(&temp);

        let output = fusecap(temp.path())
            .arg("replay")
            .arg(&scenario)
            .args(["--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let steps = json["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 8);
        assert_eq!(steps[4]["notifications"][0]["kind"], "release");
        assert_eq!(json["cache"][0]["inode"], 42);
        assert_eq!(json["cache"][0]["size"], 5);
    }

    #[test]
    fn replay_bad_filter_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        let scenario = write_scenario(&temp);

        fusecap(temp.path())
            .arg("replay")
            .arg(&scenario)
            .args(["--filter", "(["])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid filter expression"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn replay_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        fusecap(temp.path())
            .args(["replay", "does-not-exist.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("reading scenario"));
    }

    #[test]
    fn replay_invalid_scenario_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "[[steps]]\nop = \"explode\"\n").unwrap();

        fusecap(temp.path())
            .arg("replay")
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid scenario"));
    }
}
