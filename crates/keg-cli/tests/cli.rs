//! End-to-end tests driving the `keg` binary against a temporary KEG_HOME.

#![cfg(unix)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

struct Sandbox {
    tmp: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("home/formulae")).unwrap();
        fs::create_dir_all(tmp.path().join("sources")).unwrap();
        Self { tmp }
    }

    fn home(&self) -> PathBuf {
        self.tmp.path().join("home")
    }

    fn keg(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_keg"))
            .args(args)
            .env("KEG_HOME", self.home())
            .env_remove("KEG_FORMULAE")
            .env("NO_COLOR", "1")
            .output()
            .unwrap()
    }

    /// Build `<name>-1.0.tar.gz` holding `files` under a top-level directory.
    /// Returns the `file://` URL and the archive's SHA-256.
    fn archive(&self, name: &str, files: &[(&str, &str, u32)]) -> (String, String) {
        let path = self.tmp.path().join(format!("sources/{name}-1.0.tar.gz"));
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (file, content, mode) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{name}-1.0/{file}"), content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let digest = hex::encode(Sha256::digest(fs::read(&path).unwrap()));
        (format!("file://{}", path.display()), digest)
    }

    fn formula(&self, name: &str, body: &str) {
        let mut file = File::create(self.home().join(format!("formulae/{name}.toml"))).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    /// A formula installing `bin/<tool>` from a shell script.
    fn tool_formula(&self, name: &str, tool: &str, extra: &str) {
        let script = format!("#!/bin/sh\necho hello from {name}\n");
        let (url, sha256) = self.archive(name, &[("tool.sh", &script, 0o755)]);
        self.formula(
            name,
            &format!(
                r#"{extra}

[package]
name = "{name}"
version = "1.0"

[source]
url = "{url}"
sha256 = "{sha256}"

[[steps]]
kind = "mkdir"
path = "bin"

[[steps]]
kind = "copy"
from = "tool.sh"
to = "bin/{tool}"

[[test]]
kind = "output"
args = ["{{{{bin}}}}/{tool}"]
pattern = "hello from {name}"
"#
            ),
        );
    }
}

fn code(output: &Output) -> i32 {
    output.status.code().unwrap_or(-1)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn is_link(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

#[test]
fn test_install_links_and_writes_receipt() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("hello", "hello", "");

    let out = sandbox.keg(&["install", "hello"]);
    assert_eq!(code(&out), 0, "stderr: {}", stderr(&out));

    let home = sandbox.home();
    let keg = home.join("Cellar/hello/1.0");
    assert!(keg.join("bin/hello").is_file());
    assert!(keg.join("INSTALL_RECEIPT.json").is_file());

    let link = home.join("bin/hello");
    assert!(is_link(&link));
    assert_eq!(
        fs::read_link(&link).unwrap(),
        PathBuf::from("../Cellar/hello/1.0/bin/hello")
    );
    assert!(is_link(&home.join("opt/hello")));

    let receipt: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(keg.join("INSTALL_RECEIPT.json")).unwrap())
            .unwrap();
    assert_eq!(receipt["name"], "hello");
    assert_eq!(receipt["version"], "1.0");
    assert_eq!(receipt["requested"], true);
    assert_eq!(receipt["links"][0], "bin/hello");

    // A second install is a no-op.
    let again = sandbox.keg(&["install", "hello"]);
    assert_eq!(code(&again), 0);
    assert!(stdout(&again).contains("already installed"));

    let list = sandbox.keg(&["list"]);
    assert_eq!(code(&list), 0);
    assert!(stdout(&list).contains("hello"));
    assert!(stdout(&list).contains("1 keg"));
}

#[test]
fn test_dependency_installed_first() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("libfoo", "foo-config", "");
    sandbox.tool_formula("app", "app", r#"dependencies = ["libfoo"]"#);

    let out = sandbox.keg(&["install", "app"]);
    assert_eq!(code(&out), 0, "stderr: {}", stderr(&out));

    let home = sandbox.home();
    assert!(home.join("Cellar/libfoo/1.0").is_dir());
    assert!(home.join("Cellar/app/1.0").is_dir());

    let receipt: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(home.join("Cellar/libfoo/1.0/INSTALL_RECEIPT.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(receipt["requested"], false);

    // libfoo is still needed by app.
    let refused = sandbox.keg(&["uninstall", "libfoo"]);
    assert_eq!(code(&refused), 1);
    assert!(stderr(&refused).contains("required by app"));
    assert!(home.join("Cellar/libfoo/1.0").is_dir());
}

#[test]
fn test_uninstall_removes_links_and_keg() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("hello", "hello", "");
    assert_eq!(code(&sandbox.keg(&["install", "hello"])), 0);

    let out = sandbox.keg(&["uninstall", "hello"]);
    assert_eq!(code(&out), 0, "stderr: {}", stderr(&out));

    let home = sandbox.home();
    assert!(!is_link(&home.join("bin/hello")));
    assert!(!home.join("Cellar/hello").exists());
    assert!(!is_link(&home.join("opt/hello")));

    let again = sandbox.keg(&["uninstall", "hello"]);
    assert_eq!(code(&again), 1);
    assert!(stderr(&again).contains("not installed"));
}

#[test]
fn test_checksum_mismatch_exits_3() {
    let sandbox = Sandbox::new();
    let (url, _) = sandbox.archive("bad", &[("tool.sh", "#!/bin/sh\n", 0o755)]);
    sandbox.formula(
        "bad",
        &format!(
            r#"[package]
name = "bad"
version = "1.0"

[source]
url = "{url}"
sha256 = "{}"

[[steps]]
kind = "mkdir"
path = "bin"
"#,
            "0".repeat(64)
        ),
    );

    let out = sandbox.keg(&["install", "bad"]);
    assert_eq!(code(&out), 3, "stdout: {}", stdout(&out));
    assert!(!sandbox.home().join("Cellar/bad").exists());

    // One failure line per package.
    let text = stdout(&out);
    assert_eq!(text.matches("checksum mismatch").count(), 1, "stdout: {text}");
    assert!(!text.contains("hash mismatch"));
}

#[test]
fn test_cycle_exits_2() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("a", "a", r#"dependencies = ["b"]"#);
    sandbox.tool_formula("b", "b", r#"dependencies = ["a"]"#);

    let out = sandbox.keg(&["install", "a"]);
    assert_eq!(code(&out), 2);
    let err = stderr(&out);
    assert!(err.contains("circular dependency"), "stderr: {err}");
    assert!(err.contains('a') && err.contains('b'));
}

#[test]
fn test_unknown_formula_exits_2() {
    let sandbox = Sandbox::new();
    let out = sandbox.keg(&["install", "nope"]);
    assert_eq!(code(&out), 2);
}

#[test]
fn test_build_failure_exits_4_and_skips_dependents() {
    let sandbox = Sandbox::new();
    let (url, sha256) = sandbox.archive("broken", &[("README", "x", 0o644)]);
    sandbox.formula(
        "broken",
        &format!(
            r#"[package]
name = "broken"
version = "1.0"

[source]
url = "{url}"
sha256 = "{sha256}"

[[steps]]
kind = "run"
args = ["sh", "-c", "echo compile error >&2; exit 2"]
"#
        ),
    );
    sandbox.tool_formula("app", "app", r#"dependencies = ["broken"]"#);

    let out = sandbox.keg(&["install", "app"]);
    assert_eq!(code(&out), 4);
    let all = format!("{}{}", stdout(&out), stderr(&out));
    assert!(all.contains("exit code 2"), "output: {all}");
    assert!(all.contains("compile error"));
    assert!(all.contains("skipped (broken failed)"));

    let home = sandbox.home();
    assert!(!home.join("Cellar/broken").exists());
    assert!(!home.join("Cellar/app").exists());
    let log_dir = fs::read_dir(home.join("logs"))
        .unwrap()
        .filter_map(Result::ok)
        .find(|e| e.file_name().to_string_lossy().starts_with("build-broken-1.0-"))
        .expect("build log directory");
    let log = fs::read_to_string(log_dir.path().join("00.stderr.log")).unwrap();
    assert!(log.contains("compile error"));
}

#[test]
fn test_link_conflict_exits_5_and_keeps_first() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("first", "tool", "");
    sandbox.tool_formula("second", "tool", "");

    assert_eq!(code(&sandbox.keg(&["install", "first"])), 0);
    let out = sandbox.keg(&["install", "second"]);
    assert_eq!(code(&out), 5);
    assert!(stdout(&out).contains("owned by first"));

    let home = sandbox.home();
    assert_eq!(
        fs::read_link(home.join("bin/tool")).unwrap(),
        PathBuf::from("../Cellar/first/1.0/bin/tool")
    );
    assert!(!home.join("Cellar/second").exists());
}

#[test]
fn test_keg_test_command() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("hello", "hello", "");
    assert_eq!(code(&sandbox.keg(&["install", "hello"])), 0);

    let pass = sandbox.keg(&["test", "hello"]);
    assert_eq!(code(&pass), 0, "stdout: {}", stdout(&pass));

    // Break the installed tool; the test now fails without touching the keg.
    let tool = sandbox.home().join("Cellar/hello/1.0/bin/hello");
    fs::write(&tool, "#!/bin/sh\necho goodbye\n").unwrap();

    let fail = sandbox.keg(&["test", "hello"]);
    assert_eq!(code(&fail), 6);
    assert!(tool.is_file());
}

#[test]
fn test_info_shows_formula() {
    let sandbox = Sandbox::new();
    sandbox.tool_formula("hello", "hello", "");

    let out = sandbox.keg(&["info", "hello"]);
    assert_eq!(code(&out), 0);
    let text = stdout(&out);
    assert!(text.contains("hello"));
    assert!(text.contains("1.0"));
}
