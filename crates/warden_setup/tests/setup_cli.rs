use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::process::{Command as StdCommand, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Writes a config with local step files and returns its path
fn write_config(dir: &TempDir, steps: &[(&str, &str)]) -> PathBuf {
    let steps_dir = dir.path().join("steps");
    fs::create_dir_all(&steps_dir).unwrap();

    let mut config = format!(
        "[paths]\nstate_dir = \"{}\"\n\n[provision]\nsteps_base_url = \"file://{}\"\n",
        dir.path().join("state").display(),
        steps_dir.display()
    );
    for (name, body) in steps {
        fs::write(steps_dir.join(format!("{}.toml", name)), body).unwrap();
        config.push_str(&format!("\n[[provision.steps]]\nname = \"{}\"\n", name));
    }

    let path = dir.path().join("warden.toml");
    fs::write(&path, config).unwrap();
    path
}

fn setup(config: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("warden-setup").unwrap();
    cmd.arg("--config").arg(config).env_remove("WARDEN_CONFIG");
    cmd
}

const MARK_BODY: &str = r#"
description = "write a file"

[[actions]]
kind = "write_file"
path = "${INSTALL_ROOT}/done.txt"
contents = "ok"
"#;

#[test]
fn full_run_marks_every_step() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &[("01-first", "description = \"first\"\n"), ("02-second", "")],
    );

    setup(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 step(s) run"));

    assert!(dir.path().join("state/01-first.done").exists());
    assert!(dir.path().join("state/02-second.done").exists());
    assert!(dir.path().join("state/provision.log").exists());
    assert!(!dir.path().join("state/run.lock").exists());

    setup(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("0 step(s) run, 2 already done"));
}

#[test]
fn placeholders_expand_from_service_environment() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &[("01-write", MARK_BODY)]);
    let root = dir.path().join("install");
    let mut text = fs::read_to_string(&config).unwrap();
    text.push_str(&format!("\n[service]\ninstall_root = \"{}\"\n", root.display()));
    fs::write(&config, text).unwrap();

    setup(&config).assert().success();
    assert_eq!(fs::read_to_string(root.join("done.txt")).unwrap(), "ok");
}

#[test]
fn halted_run_prints_resume_command_and_log() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        &dir,
        &[
            ("01-ok", ""),
            (
                "02-fails",
                "[[actions]]\nkind = \"command\"\nprogram = \"sh\"\nargs = [\"-c\", \"exit 7\"]\n",
            ),
            ("03-never", ""),
        ],
    );

    setup(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("02-fails"))
        .stderr(predicate::str::contains(format!(
            "warden-setup --config {}",
            config.display()
        )))
        .stderr(predicate::str::contains("provision.log"));

    assert!(dir.path().join("state/01-ok.done").exists());
    assert!(!dir.path().join("state/02-fails.done").exists());
    assert!(!dir.path().join("state/03-never.done").exists());
    assert!(!dir.path().join("state/run.lock").exists());
}

#[test]
fn held_lock_fails_fast_naming_the_lock() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &[("01-ok", "")]);
    fs::create_dir_all(dir.path().join("state")).unwrap();
    // Held by this test process, which is alive
    fs::write(
        dir.path().join("state/run.lock"),
        format!(
            "{{\"pid\":{},\"acquired_at\":0,\"hostname\":\"test\"}}",
            std::process::id()
        ),
    )
    .unwrap();

    setup(&config)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("run.lock"));
    assert!(!dir.path().join("state/01-ok.done").exists());
}

#[test]
fn list_and_reset_markers() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, &[("01-a", ""), ("02-b", "")]);
    setup(&config).assert().success();

    setup(&config)
        .arg("--reset")
        .arg("02-b")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared marker for 02-b"));

    setup(&config)
        .arg("--list")
        .assert()
        .success()
        .stdout(predicate::str::contains("01-a").and(predicate::str::contains("done")))
        .stdout(predicate::str::contains("pending"));
}

#[test]
fn usage_errors_exit_one() {
    Command::cargo_bin("warden-setup")
        .unwrap()
        .arg("--bogus")
        .assert()
        .code(1);

    Command::cargo_bin("warden-setup")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn missing_explicit_config_exits_one() {
    let dir = TempDir::new().unwrap();
    setup(&dir.path().join("absent.toml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

/// Present and not a zombie awaiting its reaper
fn running(pid: &str) -> bool {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| {
            let state = stat.rsplit(')').next().unwrap_or("").trim_start();
            !state.starts_with('Z')
        })
        .unwrap_or(false)
}

fn wait_for(what: &str, timeout: Duration, mut ready: impl FnMut() -> bool) {
    let started = Instant::now();
    while !ready() {
        assert!(started.elapsed() < timeout, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn sigterm_stops_step_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("step.pid");
    let body = format!(
        "[[actions]]\nkind = \"command\"\nprogram = \"sh\"\nargs = [\"-c\", \"echo $$ > {}; exec sleep 37\"]\n",
        pid_file.display()
    );
    let config = write_config(&dir, &[("01-slow", body.as_str()), ("02-after", "")]);

    let mut setup = StdCommand::new(assert_cmd::cargo::cargo_bin("warden-setup"))
        .arg("--config")
        .arg(&config)
        .env_remove("WARDEN_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let lock = dir.path().join("state/run.lock");
    wait_for("the slow step to start", Duration::from_secs(20), || {
        fs::read_to_string(&pid_file)
            .map(|pid| !pid.trim().is_empty())
            .unwrap_or(false)
    });
    let step_pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
    assert!(lock.exists());
    assert!(running(&step_pid));

    let sent = StdCommand::new("kill")
        .arg("-TERM")
        .arg(setup.id().to_string())
        .status()
        .unwrap();
    assert!(sent.success());

    let mut status = None;
    wait_for("warden-setup to exit", Duration::from_secs(20), || {
        status = setup.try_wait().unwrap();
        status.is_some()
    });
    assert_eq!(status.unwrap().code(), Some(130));

    assert!(!lock.exists());
    wait_for("the step command to go away", Duration::from_secs(5), || {
        !running(&step_pid)
    });
    assert!(!dir.path().join("state/01-slow.done").exists());
    assert!(!dir.path().join("state/02-after.done").exists());
}
