//! Integration tests for Rigger

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated home, config and cache for one test
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            dir: TempDir::new().unwrap(),
        };
        std::fs::create_dir_all(sandbox.project()).unwrap();
        std::fs::write(
            sandbox.config(),
            format!(
                "[general]\nevent_log = false\n\n[cache]\ndir = {:?}\n",
                sandbox.cache_dir()
            ),
        )
        .unwrap();
        sandbox
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    fn project(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    fn write_pipeline(&self, content: &str) {
        std::fs::write(self.project().join("rigger.toml"), content).unwrap();
    }

    fn rigger(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("rigger");
        cmd.current_dir(self.project())
            .env("HOME", self.dir.path())
            .env("XDG_STATE_HOME", self.dir.path().join("state"))
            .env_remove("RIGGER_REVISION")
            .env_remove("RIGGER_BRANCH")
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(self.config());
        cmd
    }
}

fn registry_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = match std::fs::read_dir(root.join("demo/1.0")) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

const PIPELINE: &str = r#"
[package]
name = "demo"

[matrix]
fail_fast = false
[[matrix.axis]]
name = "os"
values = ["linux", "macos"]
[[matrix.axis]]
name = "runtime"
values = ["3.8", "3.9"]

[dependencies]
key = "deps-{os}-{runtime}-{branch}-v{generation}"
paths = [".venv"]
install = ['mkdir -p .venv && echo "$RIGGER_OS $RIGGER_RUNTIME" > .venv/deps.txt']

[[test.steps]]
uses = "install"

[[test.steps]]
name = "libomp"
run = "echo installing libomp"
when = { os = "macos" }

[[test.steps]]
name = "unit tests"
run = 'test -f .venv/deps.txt'

[[release.steps]]
uses = "install"

[[release.steps]]
uses = "build"

[build]
run = 'echo "wheel $RIGGER_CELL" > "$RIGGER_DIST_DIR/demo-1.0-cp$(echo $RIGGER_RUNTIME | tr -d .)-$RIGGER_OS.whl"'

[[transform]]
when = { os = "linux" }
platform_tags = { linux = "manylinux1" }

[publish]
registry = "registry"
accepted_tags = ["macos"]
"#;

mod cli_tests {
    use super::*;

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("rigger")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("matrix build, test and release"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("rigger")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("rigger"));
    }

    #[test]
    fn config_path_honours_flag() {
        let sandbox = Sandbox::new();
        sandbox
            .rigger()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .rigger()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("max_parallel"));
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let sandbox = Sandbox::new();
        sandbox
            .rigger()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn missing_pipeline_fails_with_hint() {
        let sandbox = Sandbox::new();
        sandbox
            .rigger()
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("rigger.toml"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn invalid_pipeline_is_rejected() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline("[package]\nname = \"demo\"\n[[test.steps]]\nuses = \"install\"\n");
        sandbox
            .rigger()
            .args(["matrix"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("[dependencies]"));
    }

    #[test]
    fn matrix_lists_cells_and_guarded_steps() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(PIPELINE);
        sandbox
            .rigger()
            .args(["matrix", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("os=linux,runtime=3.8"))
            .stdout(predicate::str::contains("os=macos,runtime=3.9"));

        let output = sandbox
            .rigger()
            .args(["matrix", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let plans: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let plans = plans.as_array().unwrap();
        assert_eq!(plans.len(), 4);
        let with_libomp = plans
            .iter()
            .filter(|p| {
                p["steps"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .any(|s| s == "libomp")
            })
            .count();
        assert_eq!(with_libomp, 2);
    }
}

#[cfg(unix)]
mod pipeline_tests {
    use super::*;

    #[test]
    fn test_pipeline_passes_and_fills_cache() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(PIPELINE);

        sandbox
            .rigger()
            .args(["run", "--format", "plain", "--revision", "abc123"])
            .assert()
            .success()
            .stdout(predicate::str::contains("os=macos,runtime=3.9\tsucceeded"));

        sandbox
            .rigger()
            .args(["cache", "list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("deps-linux-3.8-main-v1"));

        let deps = sandbox
            .project()
            .join(".rigger/cells/00-os_linux_runtime_3.8/.venv/deps.txt");
        let installed = std::fs::read(&deps).unwrap();
        assert_eq!(installed, b"linux 3.8\n");
        assert!(!sandbox.project().join(".venv").exists());

        // second run restores the same bytes from the cache
        sandbox
            .rigger()
            .args(["run", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache hit"));
        assert_eq!(std::fs::read(&deps).unwrap(), installed);
    }

    #[test]
    fn install_that_misses_declared_path_fails_without_caching() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(&PIPELINE.replace("mkdir -p .venv && ", "").replace(
            "> .venv/deps.txt",
            "> deps.txt",
        ));

        sandbox
            .rigger()
            .args(["run", "--format", "plain"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("os=linux,runtime=3.8\tfailed"));

        sandbox
            .rigger()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }

    #[test]
    fn failing_required_step_fails_the_run() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(&PIPELINE.replace(
            r#"run = "echo installing libomp""#,
            r#"run = "exit 3""#,
        ));

        sandbox
            .rigger()
            .args(["run", "--format", "plain"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("os=macos,runtime=3.8\tfailed"))
            .stdout(predicate::str::contains("os=linux,runtime=3.8\tsucceeded"))
            .stderr(predicate::str::contains("2 cell(s) failed"));
    }

    #[test]
    fn release_publishes_once_then_skips() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(PIPELINE);
        let registry = sandbox.project().join("registry");

        sandbox
            .rigger()
            .args(["run", "--release", "--branch", "v1.0", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("demo-1.0-cp38-manylinux1.whl\tpublished"));

        let files = registry_files(&registry);
        assert_eq!(
            files,
            vec![
                "demo-1.0-cp38-macos.whl",
                "demo-1.0-cp38-manylinux1.whl",
                "demo-1.0-cp39-macos.whl",
                "demo-1.0-cp39-manylinux1.whl",
            ]
        );
        let exported = sandbox.project().join(".rigger/dist/demo-1.0-cp39-macos.whl");
        assert_eq!(
            std::fs::read_to_string(exported).unwrap().trim(),
            "wheel os=macos,runtime=3.9"
        );

        sandbox
            .rigger()
            .args(["run", "--release", "--branch", "v1.0", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("skipped"));
        assert_eq!(registry_files(&registry).len(), 4);
    }

    #[test]
    fn release_event_file_selects_release_pipeline() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(PIPELINE);
        let event = sandbox.dir.path().join("event.json");
        std::fs::write(
            &event,
            r#"{"revision": "9f1c2e", "branch": "v1.0", "release_published": true}"#,
        )
        .unwrap();

        let output = sandbox
            .rigger()
            .args(["run", "--format", "json", "--event"])
            .arg(&event)
            .output()
            .unwrap();
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(report["kind"], "release");
        assert_eq!(report["revision"], "9f1c2e");
        assert_eq!(report["publish"]["records"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn cache_clear_requires_confirmation() {
        let sandbox = Sandbox::new();
        sandbox.write_pipeline(PIPELINE);
        sandbox.rigger().arg("run").assert().success();

        // Non-interactive without --yes aborts
        sandbox
            .rigger()
            .args(["cache", "clear"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Aborted"));

        sandbox
            .rigger()
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared 4 entries"));

        sandbox
            .rigger()
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));
    }
}
