//! Integration tests for pipelib

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn pipelib() -> Command {
        cargo_bin_cmd!("pipelib")
    }

    /// Temp workspace with a config, a cache root and one library source
    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            for version in ["1.0", "2.0"] {
                let vars = temp.path().join("sources/utils").join(version).join("vars");
                fs::create_dir_all(&vars).unwrap();
                fs::write(vars.join("deploy.groovy"), "def call() {}").unwrap();
            }

            let config = format!(
                r#"
[cache]
root = '{root}'
secret_key_path = '{key}'
fetch_retry_delay_ms = 1
eviction_timeout_secs = 1

[[providers]]
id = "global"
trusted = true

[[providers.libraries]]
name = "utils"
default_version = "1.0"
allow_branch_name_placeholder = true

[providers.libraries.caching]
refresh_minutes = 0
excluded_versions = "SNAPSHOT"

[providers.libraries.retriever]
kind = "directory"
root = '{sources}'
"#,
                root = temp.path().join("cache").display(),
                key = temp.path().join("secret.key").display(),
                sources = temp.path().join("sources/utils").display(),
            );
            fs::write(temp.path().join("config.toml"), config).unwrap();
            Self { temp }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.temp.path().join(rel)
        }

        fn cmd(&self) -> Command {
            let mut cmd = pipelib();
            cmd.arg("--config")
                .arg(self.path("config.toml"))
                .env_remove("BRANCH_NAME")
                .env_remove("PIPELIB_CONFIG");
            cmd
        }

        fn resolve(&self, build: &str, refs: &[&str]) -> Command {
            let mut cmd = self.cmd();
            cmd.arg("resolve")
                .args(refs)
                .arg("--clean-env")
                .arg("--build-dir")
                .arg(self.path(build));
            cmd
        }
    }

    fn cache_entries(root: &Path) -> usize {
        fs::read_dir(root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn help_displays() {
        pipelib()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("pipeline library resolution"));
    }

    #[test]
    fn version_displays() {
        pipelib()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pipelib"));
    }

    #[test]
    fn config_path() {
        let fixture = Fixture::new();
        fixture
            .cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let fixture = Fixture::new();
        fixture
            .cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("utils"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("fresh").join("config.toml");
        pipelib()
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success();
        assert!(fs::read_to_string(&path).unwrap().contains("retention_days = 7"));
    }

    #[test]
    fn resolve_fills_then_hits_cache() {
        let fixture = Fixture::new();

        fixture
            .resolve("build-1", &["utils@2.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("miss"))
            .stdout(predicate::str::contains("deploy"));

        fixture
            .resolve("build-2", &["utils@2.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("hit"));

        assert_eq!(cache_entries(&fixture.path("cache")), 1);
        assert!(fixture.path("build-2/libraries.json").is_file());
    }

    #[test]
    fn concurrent_builds_share_one_entry() {
        let fixture = Fixture::new();
        std::thread::scope(|scope| {
            for build in ["build-a", "build-b", "build-c"] {
                let fixture = &fixture;
                scope.spawn(move || {
                    fixture.resolve(build, &["utils@2.0"]).assert().success();
                });
            }
        });

        assert_eq!(cache_entries(&fixture.path("cache")), 1);
        for build in ["build-a", "build-b", "build-c"] {
            assert!(fixture.path(build).join("libraries.json").is_file());
        }
    }

    #[test]
    fn resolve_branch_placeholder_falls_back_to_default() {
        let fixture = Fixture::new();
        fixture
            .resolve("build", &["utils@${BRANCH_NAME}", "--format", "plain", "--trace"])
            .args(["-e", "BRANCH_NAME=feature/x"])
            .assert()
            .success()
            .stdout(predicate::str::contains("utils@1.0"))
            .stderr(predicate::str::contains("falling back"));
    }

    #[test]
    fn resolve_excluded_version_skips_cache() {
        let fixture = Fixture::new();
        let snapshot = fixture.path("sources/utils/3.0-SNAPSHOT/vars");
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(snapshot.join("deploy.groovy"), "").unwrap();

        fixture
            .resolve("build", &["utils@3.0-SNAPSHOT"])
            .assert()
            .success()
            .stdout(predicate::str::contains("excluded"));
        assert_eq!(cache_entries(&fixture.path("cache")), 0);
    }

    #[test]
    fn resolve_unknown_library_fails() {
        let fixture = Fixture::new();
        fixture
            .resolve("build", &["nope"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("No library named nope"))
            .stderr(predicate::str::contains("1 of 1 libraries failed"));
    }

    #[test]
    fn cache_list_and_evict() {
        let fixture = Fixture::new();
        fixture.resolve("build", &["utils@1.0"]).assert().success();

        fixture
            .cmd()
            .args(["cache", "list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"name\": \"utils\""));

        fixture
            .cmd()
            .args(["cache", "evict", "utils", "--versions", "2.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries"));

        fixture
            .cmd()
            .args(["cache", "evict", "utils"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 1 cache entry"));
        assert_eq!(cache_entries(&fixture.path("cache")), 0);
    }

    #[test]
    fn cache_gc_dry_run_keeps_fresh_entries() {
        let fixture = Fixture::new();
        fixture.resolve("build", &["utils"]).assert().success();

        fixture
            .cmd()
            .args(["cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cache entries unread"));
        assert_eq!(cache_entries(&fixture.path("cache")), 1);
    }

    #[test]
    fn invalid_config_reports_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(&path, "[general]\nlog_format = \"xml\"\n").unwrap();
        pipelib()
            .arg("--config")
            .arg(&path)
            .args(["cache", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}
