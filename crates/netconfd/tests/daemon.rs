use std::{
    io::Write,
    process::{Command, Stdio},
};

use anyhow::Context;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

#[allow(dead_code)]
mod support;

use support::{netconfd_bin, tmpdir, wait_until};

#[test]
fn start() -> anyhow::Result<()> {
    let tmp_dir = tmpdir::Dir::new("netconfd-test").context("creating tmp dir")?;
    let sock = tmp_dir.path().join("netconfd.sock");

    let mut child = Command::new(netconfd_bin()?)
        .arg("--socket")
        .arg(&sock)
        .arg("serve")
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning netconfd")?;

    wait_until(|| Ok(sock.exists()))?;

    child.kill().context("killing netconfd")?;
    let out = child.wait_with_output().context("waiting on netconfd")?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("STARTING DAEMON"), "missing startup banner in stderr: {stderr}");

    Ok(())
}

#[test]
fn config() -> anyhow::Result<()> {
    let tmp_dir = tmpdir::Dir::new("netconfd-test").context("creating tmp dir")?;
    let sock = tmp_dir.path().join("netconfd.sock");
    let config_path = tmp_dir.path().join("config.toml");
    std::fs::write(&config_path, format!("socket = \"{}\"\n", sock.display()))
        .context("writing config file")?;

    let mut child = Command::new(netconfd_bin()?)
        .arg("--config-file")
        .arg(&config_path)
        .arg("serve")
        .stderr(Stdio::piped())
        .spawn()
        .context("spawning netconfd")?;

    wait_until(|| Ok(sock.exists()))?;

    child.kill().context("killing netconfd")?;
    let out = child.wait_with_output().context("waiting on netconfd")?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("STARTING DAEMON"), "missing startup banner in stderr: {stderr}");

    Ok(())
}

#[test]
fn cleanup_socket() -> anyhow::Result<()> {
    let tmp_dir = tmpdir::Dir::new("netconfd-test").context("creating tmp dir")?;
    let sock = tmp_dir.path().join("netconfd.sock");

    let child = Command::new(netconfd_bin()?)
        .arg("--socket")
        .arg(&sock)
        .arg("serve")
        .stderr(Stdio::null())
        .spawn()
        .context("spawning netconfd")?;

    wait_until(|| Ok(sock.exists()))?;

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).context("sending SIGINT")?;

    wait_until(|| Ok(!sock.exists()))?;

    Ok(())
}

#[test]
fn check_config_reports_valid_config() -> anyhow::Result<()> {
    let tmp_dir = tmpdir::Dir::new("netconfd-test").context("creating tmp dir")?;
    let config_path = tmp_dir.path().join("config.toml");
    std::fs::write(&config_path, "buf_size = 4096\n").context("writing config file")?;

    let out = Command::new(netconfd_bin()?)
        .arg("--config-file")
        .arg(&config_path)
        .arg("check-config")
        .output()
        .context("running check-config")?;

    assert!(out.status.success(), "check-config failed: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("config ok"), "unexpected stdout: {stdout}");

    Ok(())
}

#[test]
fn check_config_reports_malformed_config() -> anyhow::Result<()> {
    let tmp_dir = tmpdir::Dir::new("netconfd-test").context("creating tmp dir")?;
    let config_path = tmp_dir.path().join("config.toml");
    let mut f = std::fs::File::create(&config_path).context("creating config file")?;
    f.write_all(b"this is not valid toml = = =").context("writing config file")?;
    drop(f);

    let out = Command::new(netconfd_bin()?)
        .arg("--config-file")
        .arg(&config_path)
        .arg("check-config")
        .output()
        .context("running check-config")?;

    assert!(!out.status.success(), "expected check-config to fail on malformed toml");

    Ok(())
}
