//! Proxy-core process supervision
//!
//! A [`ProcessSupervisor`] owns one external proxy-core process:
//! - spawning it in its own process group with a rendered config
//! - treating an exit inside the start grace window as a start failure
//! - polling the control API until it answers
//! - SIGTERM to the group on stop, escalating to SIGKILL
//! - killing the group on drop if `stop` was never reached

use crate::config::PipelineConfig;
use crate::core::api::{ControlApi, DelayOutcome};
use crate::core::ports::PortTriple;
use crate::core::registry::{kill_group, ProcessRegistry};
use crate::error::{ApiError, SupervisorError};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Captured output kept when a core dies during startup
const MAX_CAPTURED_OUTPUT: usize = 500;

/// How long to wait for a dead core's output pipes
const OUTPUT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One running proxy-core instance as the stages see it
#[async_trait]
pub trait ProxyCore: Send + Sync {
    fn ports(&self) -> PortTriple;

    async fn start(&mut self, config_path: &Path) -> std::result::Result<(), SupervisorError>;

    /// Poll the control API until it answers or `timeout` elapses
    async fn wait_for_api(&mut self, timeout: Duration) -> bool;

    async fn list_active_proxies(&self) -> std::result::Result<Vec<String>, ApiError>;

    async fn measure_delay(
        &self,
        name: &str,
        test_url: &str,
        timeout_ms: u32,
        ceiling_ms: u32,
    ) -> DelayOutcome;

    async fn switch_active(&self, group: &str, proxy: &str) -> std::result::Result<(), ApiError>;

    /// Idempotent; never fails
    async fn stop(&mut self);
}

/// Creates proxy-core instances bound to a port triple
pub trait CoreLauncher: Send + Sync {
    fn launch(&self, ports: PortTriple) -> Result<Box<dyn ProxyCore>>;
}

/// Launches real [`ProcessSupervisor`]s from the pipeline config
#[derive(Clone)]
pub struct ProcessLauncher {
    config: Arc<PipelineConfig>,
    registry: ProcessRegistry,
}

impl ProcessLauncher {
    pub fn new(config: Arc<PipelineConfig>, registry: ProcessRegistry) -> Self {
        Self { config, registry }
    }
}

impl CoreLauncher for ProcessLauncher {
    fn launch(&self, ports: PortTriple) -> Result<Box<dyn ProxyCore>> {
        let supervisor = ProcessSupervisor::new(&self.config, ports, self.registry.clone())?;
        Ok(Box::new(supervisor))
    }
}

/// Owns the lifecycle of one external proxy-core process
pub struct ProcessSupervisor {
    binary: PathBuf,
    ports: PortTriple,
    api: ControlApi,
    start_grace: Duration,
    stop_timeout: Duration,
    poll_interval: Duration,
    registry: ProcessRegistry,
    child: Option<Child>,
    pgid: Option<i32>,
}

impl ProcessSupervisor {
    pub fn new(config: &PipelineConfig, ports: PortTriple, registry: ProcessRegistry) -> Result<Self> {
        let api = ControlApi::new(
            &config.api_host,
            ports.api,
            config.api_secret.clone(),
            config.api_request_timeout,
        )?;
        Ok(Self {
            binary: config.core_binary.clone(),
            ports,
            api,
            start_grace: config.start_grace,
            stop_timeout: config.stop_timeout,
            poll_interval: config.api_poll_interval,
            registry,
            child: None,
            pgid: None,
        })
    }

    /// Replace the control API client, e.g. to point at a different host
    pub fn with_api(mut self, api: ControlApi) -> Self {
        self.api = api;
        self
    }

    pub fn api(&self) -> &ControlApi {
        &self.api
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn spawn(&mut self, config_path: &Path) -> std::result::Result<(), SupervisorError> {
        let binary = resolve_binary(&self.binary)
            .ok_or_else(|| SupervisorError::BinaryNotFound(self.binary.clone()))?;
        if !config_path.exists() {
            return Err(SupervisorError::ConfigNotFound(config_path.to_path_buf()));
        }

        let mut cmd = Command::new(&binary);
        cmd.arg("-f")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            "Starting proxy core {:?} -f {:?} ({})",
            binary, config_path, self.ports
        );
        let mut child = cmd.spawn()?;
        let pid = child.id();

        // The child leads its own group, so its pid is the group id
        let pgid = pid.and_then(|p| i32::try_from(p).ok());
        if let Some(pgid) = pgid {
            self.registry.register(pgid);
        }

        sleep(self.start_grace).await;

        if let Ok(Some(status)) = child.try_wait() {
            // Forked children outlive the leader and keep the output pipes open
            if let Some(pgid) = pgid {
                if let Err(e) = kill_group(pgid) {
                    debug!("kill of group {} after early exit failed: {}", pgid, e);
                }
                self.registry.unregister(pgid);
            }
            let output = captured_output(child).await;
            warn!("Proxy core exited during startup ({}): {}", status, output);
            return Err(SupervisorError::ExitedEarly {
                status: status.to_string(),
                output,
            });
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, self.ports.api));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, self.ports.api));
        }

        debug!("Proxy core running with pid {:?}", pid);
        self.child = Some(child);
        self.pgid = pgid;
        Ok(())
    }
}

#[async_trait]
impl ProxyCore for ProcessSupervisor {
    fn ports(&self) -> PortTriple {
        self.ports
    }

    async fn start(&mut self, config_path: &Path) -> std::result::Result<(), SupervisorError> {
        if self.child.is_some() {
            self.stop().await;
        }
        self.spawn(config_path).await
    }

    async fn wait_for_api(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.child.is_some() && !self.is_running() {
                warn!("Proxy core died before its control API came up");
                return false;
            }
            match self.api.version().await {
                Ok(version) => {
                    info!("Control API ready on port {} (version {})", self.ports.api, version);
                    return true;
                }
                Err(e) => debug!("control API not ready yet: {}", e),
            }
            if Instant::now() + self.poll_interval > deadline {
                warn!("Control API on port {} not ready after {:?}", self.ports.api, timeout);
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn list_active_proxies(&self) -> std::result::Result<Vec<String>, ApiError> {
        self.api.list_proxies().await
    }

    async fn measure_delay(
        &self,
        name: &str,
        test_url: &str,
        timeout_ms: u32,
        ceiling_ms: u32,
    ) -> DelayOutcome {
        self.api
            .measure_delay(name, test_url, timeout_ms, ceiling_ms)
            .await
    }

    async fn switch_active(&self, group: &str, proxy: &str) -> std::result::Result<(), ApiError> {
        self.api.switch(group, proxy).await
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pgid = self.pgid.take();

        terminate(pgid, &mut child);
        match timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("Proxy core exited: {}", status),
            Ok(Err(e)) => warn!("Error waiting for proxy core: {}", e),
            Err(_) => {
                warn!("Proxy core ignored SIGTERM, killing process group");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill proxy core: {}", e);
                }
            }
        }

        // Leftover group members die with the leader
        if let Some(pgid) = pgid {
            if let Err(e) = kill_group(pgid) {
                debug!("final kill of group {} failed: {}", pgid, e);
            }
            self.registry.unregister(pgid);
        }
        info!("Proxy core on port {} stopped", self.ports.api);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.child.is_none() {
            return;
        }
        if let Some(pgid) = self.pgid.take() {
            warn!("Proxy core on port {} dropped while running, killing", self.ports.api);
            let _ = kill_group(pgid);
            self.registry.unregister(pgid);
        }
    }
}

#[cfg(unix)]
fn terminate(pgid: Option<i32>, child: &mut Child) {
    use crate::core::registry::signal_group;
    use nix::sys::signal::Signal;

    match pgid {
        Some(pgid) => {
            if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
                debug!("SIGTERM to group {} failed: {}", pgid, e);
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pgid: Option<i32>, child: &mut Child) {
    let _ = child.start_kill();
}

/// Locate the core binary, searching `PATH` for bare names
fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 || binary.is_absolute() {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

async fn captured_output(child: Child) -> String {
    let output = match timeout(OUTPUT_READ_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        _ => return "(no output)".to_string(),
    };
    let text = if output.stderr.is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        String::from_utf8_lossy(&output.stderr).into_owned()
    };
    let text = text.trim();
    if text.is_empty() {
        return "(no output)".to_string();
    }
    truncate_utf8(text, MAX_CAPTURED_OUTPUT).to_string()
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

async fn drain_output<R: AsyncRead + Unpin>(reader: R, api_port: u16) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "node_validator::core::output", port = api_port, "{}", line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> PipelineConfig {
        PipelineConfig::new()
            .with_core_binary("/bin/sh")
            .with_start_grace(Duration::from_millis(200))
            .with_stop_timeout(Duration::from_millis(500))
            .with_api_poll_interval(Duration::from_millis(50))
    }

    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("core.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn supervisor(config: &PipelineConfig, registry: &ProcessRegistry) -> ProcessSupervisor {
        ProcessSupervisor::new(config, PortTriple::new(19091, 19090, 19092), registry.clone()).unwrap()
    }

    fn pid_alive(pid: u32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = script(&dir, "exec sleep 30\n");
        let registry = ProcessRegistry::new();
        let mut sup = supervisor(&test_config(), &registry);

        sup.start(&config_path).await.unwrap();
        let pid = sup.pid().unwrap();
        assert!(sup.is_running());
        assert_eq!(registry.len(), 1);

        sup.stop().await;
        assert!(!sup.is_running());
        assert!(registry.is_empty());
        assert!(!pid_alive(pid));

        // Second stop is a no-op
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_early_exit_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = script(&dir, "echo 'parse config error' >&2\nexit 3\n");
        let registry = ProcessRegistry::new();
        let mut sup = supervisor(&test_config(), &registry);

        match sup.start(&config_path).await {
            Err(SupervisorError::ExitedEarly { output, .. }) => {
                assert!(output.contains("parse config error"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.is_empty());
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_stop_escalates_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = script(&dir, "trap '' TERM\nwhile true; do sleep 0.1; done\n");
        let registry = ProcessRegistry::new();
        let mut sup = supervisor(&test_config(), &registry);

        sup.start(&config_path).await.unwrap();
        let pid = sup.pid().unwrap();

        let started = Instant::now();
        sup.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!pid_alive(pid));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();

        let config = test_config().with_core_binary("/nonexistent/core");
        let mut sup = supervisor(&config, &registry);
        let config_path = script(&dir, "exit 0\n");
        assert!(matches!(
            sup.start(&config_path).await,
            Err(SupervisorError::BinaryNotFound(_))
        ));

        let mut sup = supervisor(&test_config(), &registry);
        assert!(matches!(
            sup.start(&dir.path().join("missing.yaml")).await,
            Err(SupervisorError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "test"})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config_path = script(&dir, "exec sleep 30\n");
        let registry = ProcessRegistry::new();
        let api = ControlApi::with_base_url(&server.uri(), None, Duration::from_millis(200)).unwrap();
        let mut sup = supervisor(&test_config(), &registry).with_api(api);

        sup.start(&config_path).await.unwrap();
        assert!(sup.wait_for_api(Duration::from_secs(2)).await);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_api_times_out() {
        let server = MockServer::start().await;
        let registry = ProcessRegistry::new();
        let api = ControlApi::with_base_url(&server.uri(), None, Duration::from_millis(100)).unwrap();
        let mut sup = supervisor(&test_config(), &registry).with_api(api);

        let started = Instant::now();
        assert!(!sup.wait_for_api(Duration::from_millis(300)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8(&"x".repeat(600), MAX_CAPTURED_OUTPUT).len(), 500);
    }
}
