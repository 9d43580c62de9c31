#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::process::Command;

    use tempfile::NamedTempFile;

    fn binary() -> Command {
        Command::new(env!("CARGO_BIN_EXE_dmz-failover"))
    }

    #[test]
    fn test_too_many_stations_exits_with_1() {
        let output = binary().args(["--nWifi", "251"]).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("no more than 250"), "stderr: {}", stderr);
    }

    #[test]
    fn test_short_run_prints_report() {
        let mut config = NamedTempFile::new().unwrap();
        config
            .write_all(b"[traffic]\nduration_s = 3\n\n[failover]\nsampling_interval_ms = 1000\n")
            .unwrap();

        let output = binary()
            .args(["--nWifi", "2", "--config"])
            .arg(config.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Failover state: BothHealthy"), "stdout: {}", stdout);
        assert!(stdout.contains("sta0 -> ap -> Fst -> tr -> Lst -> fw -> server"));
        assert!(stdout.contains("6 hops"));
    }

    #[test]
    fn test_invalid_config_exits_with_1() {
        let mut config = NamedTempFile::new().unwrap();
        config
            .write_all(b"[failover]\noverload_threshold = 10.0\nrecovery_threshold = 20.0\n")
            .unwrap();
        let output = binary().arg("--config").arg(config.path()).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
    }
}
