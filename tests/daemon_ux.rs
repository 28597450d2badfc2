#[cfg(unix)]
mod unix_tests {
    // Daemon UX: creates its log file, registers a sync session, and exits
    // cleanly on Ctrl+C (SIGINT).
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn daemon_creates_log_and_exits_on_sigint() {
        let home = std::env::temp_dir().join("tunnelbox-rs-daemon-ux-home");
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).unwrap();

        let cfg_path = home.join(".tunnelbox").join("config.json");
        std::fs::create_dir_all(cfg_path.parent().unwrap()).unwrap();
        std::fs::write(
            &cfg_path,
            r#"{
              "registry_path": "registry.json"
            }"#,
        )
        .unwrap();

        let exe = env!("CARGO_BIN_EXE_tunnelbox-rs");
        let mut child = Command::new(exe)
            .env("HOME", &home)
            .arg("-c")
            .arg(&cfg_path)
            .arg("daemon")
            .spawn()
            .expect("spawn daemon");

        let log_path = home.join(".tunnelbox").join("logs").join("tunnelbox.log");
        let saw_startup = wait_for(Duration::from_secs(3), || {
            std::fs::read_to_string(&log_path)
                .ok()
                .map(|s| s.contains("daemon start") && s.contains("registry sync session"))
                .unwrap_or(false)
        });
        assert!(saw_startup, "expected daemon startup lines in log");

        let pid = child.id();
        let status = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .expect("send SIGINT");
        assert!(status.success());

        let exited = wait_for(Duration::from_secs(3), || {
            child.try_wait().ok().flatten().is_some()
        });
        if !exited {
            let _ = Command::new("kill")
                .arg("-KILL")
                .arg(pid.to_string())
                .status();
            panic!("daemon did not exit after SIGINT");
        }
        let st = child.wait().unwrap();
        assert!(st.success());
    }
}
