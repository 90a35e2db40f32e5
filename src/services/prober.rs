use super::events::{EngineEvent, EventBus, ProbeAttempt, ProbeOutcome};
use super::lifecycle::LifecycleManager;
use super::system_service::HealthGate;
use crate::domain::{ContainerId, ContainerSnapshot, ContainerState, EngineError, Result};
use reqwest::Client;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a single readiness attempt checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCheck {
    /// Passes when the command exits with status 0 inside the container.
    Exec { command: Vec<String> },
    /// Passes when a TCP connection to the container address succeeds.
    Tcp { port: u16 },
    /// Passes on a 2xx or 3xx answer to `GET path`.
    Http { port: u16, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessProbe {
    pub check: ProbeCheck,
    pub interval: Duration,
    /// Total number of attempts, at least one.
    pub max_retries: u32,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl ReadinessProbe {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_RETRIES: u32 = 30;
    pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            interval: Self::DEFAULT_INTERVAL,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            attempt_timeout: Self::DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn exec<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ProbeCheck::Exec {
            command: command.into_iter().map(Into::into).collect(),
        })
    }

    pub fn tcp(port: u16) -> Self {
        Self::new(ProbeCheck::Tcp { port })
    }

    pub fn http(port: u16, path: impl Into<String>) -> Self {
        Self::new(ProbeCheck::Http {
            port,
            path: path.into(),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }
}

/// Result of a probe that eventually passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Polls a running container until its readiness check passes.
pub struct ReadinessProber {
    containers: Arc<LifecycleManager>,
    events: EventBus,
    gate: HealthGate,
    http: Client,
}

impl ReadinessProber {
    pub fn new(containers: Arc<LifecycleManager>, events: EventBus, gate: HealthGate) -> Self {
        Self {
            containers,
            events,
            gate,
            http: probe_client(),
        }
    }

    /// Runs the check right away and then once per interval until it passes
    /// or `max_retries` attempts have failed. Every attempt is published as an
    /// [`EngineEvent::Probe`].
    pub async fn probe(&self, id: &ContainerId, probe: &ReadinessProbe) -> Result<ProbeReport> {
        self.gate.ensure()?;
        if probe.max_retries == 0 {
            return Err(EngineError::InvalidConfiguration(
                "readiness probe needs at least one attempt".into(),
            ));
        }

        let snapshot = self.containers.inspect(id).await?;
        if snapshot.state != ContainerState::Running {
            return Err(EngineError::InvalidState(format!(
                "cannot probe {} while it is {}",
                snapshot.name, snapshot.state
            )));
        }

        info!(
            "Waiting for {} to become ready (up to {} attempts every {:?})",
            snapshot.name, probe.max_retries, probe.interval
        );
        let started = Instant::now();

        for attempt in 1..=probe.max_retries {
            let outcome = match tokio::time::timeout(
                probe.attempt_timeout,
                self.check_once(&snapshot, probe),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Failed(format!(
                    "attempt timed out after {:?}",
                    probe.attempt_timeout
                )),
            };
            let elapsed = started.elapsed();

            match &outcome {
                ProbeOutcome::Passed => {
                    info!("{} is ready after {attempt} attempts", snapshot.name)
                }
                ProbeOutcome::Failed(reason) => debug!(
                    "{} not ready ({attempt}/{}): {reason}",
                    snapshot.name, probe.max_retries
                ),
            }

            let passed = outcome.passed();
            self.events.publish(EngineEvent::Probe(ProbeAttempt {
                container: id.clone(),
                attempt,
                max_attempts: probe.max_retries,
                elapsed,
                outcome,
            }));

            if passed {
                return Ok(ProbeReport {
                    attempts: attempt,
                    elapsed,
                });
            }
            if attempt < probe.max_retries {
                tokio::time::sleep(probe.interval).await;
            }
        }

        warn!(
            "{} failed its readiness probe after {} attempts",
            snapshot.name, probe.max_retries
        );
        Err(EngineError::ReadinessTimeout {
            container: snapshot.name,
            attempts: probe.max_retries,
        })
    }

    async fn check_once(&self, snapshot: &ContainerSnapshot, probe: &ReadinessProbe) -> ProbeOutcome {
        match &probe.check {
            ProbeCheck::Exec { command } => {
                let result = match self.containers.exec(&snapshot.id, command).await {
                    Ok(handle) => handle.wait().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(0) => ProbeOutcome::Passed,
                    Ok(code) => ProbeOutcome::Failed(format!("exit code {code}")),
                    Err(e) => ProbeOutcome::Failed(e.to_string()),
                }
            }
            ProbeCheck::Tcp { port } => match snapshot.address() {
                Some(address) => tcp_check(address, *port).await,
                None => ProbeOutcome::Failed("container has no network address".into()),
            },
            ProbeCheck::Http { port, path } => match snapshot.address() {
                Some(address) => {
                    http_check(&self.http, address, *port, path, probe.attempt_timeout).await
                }
                None => ProbeOutcome::Failed("container has no network address".into()),
            },
        }
    }
}

fn probe_client() -> Client {
    // Container addresses are never reachable through an outbound proxy.
    Client::builder()
        .user_agent(concat!("stevedore/", env!("CARGO_PKG_VERSION")))
        .no_proxy()
        .build()
        .unwrap_or_else(|e| {
            warn!("Falling back to a default HTTP client for readiness checks: {e}");
            Client::new()
        })
}

async fn tcp_check(address: Ipv4Addr, port: u16) -> ProbeOutcome {
    match TcpStream::connect((address, port)).await {
        Ok(_) => ProbeOutcome::Passed,
        Err(e) => ProbeOutcome::Failed(format!("{address}:{port}: {e}")),
    }
}

async fn http_check(
    client: &Client,
    address: Ipv4Addr,
    port: u16,
    path: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let path = path.strip_prefix('/').unwrap_or(path);
    let url = format!("http://{address}:{port}/{path}");
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() || status.is_redirection() {
                ProbeOutcome::Passed
            } else {
                ProbeOutcome::Failed(format!("HTTP {status}"))
            }
        }
        Err(e) => ProbeOutcome::Failed(format!("{url}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContainerConfig;
    use crate::engine::{Engine, EngineSettings};
    use crate::test_support::{MockBackend, MockImages};

    async fn running(name: &str) -> (Engine, Arc<MockBackend>, ContainerId) {
        let mock = Arc::new(MockBackend::new());
        let engine = Engine::boot(
            mock.clone(),
            Arc::new(MockImages::new()),
            EngineSettings::default(),
        )
        .await;
        let id = engine
            .containers()
            .create(ContainerConfig::new("postgres:16").with_name(name))
            .await
            .unwrap();
        engine.containers().start(&id).await.unwrap();
        (engine, mock, id)
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probe_exhausts_exactly_max_retries() {
        let (engine, _mock, id) = running("db").await;
        let mut events = engine.subscribe();

        let probe = ReadinessProbe::exec(["false"])
            .with_interval(Duration::from_secs(2))
            .with_max_retries(4);
        let err = engine.prober().probe(&id, &probe).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ReadinessTimeout { attempts: 4, .. }
        ));

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Probe(attempt) = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|a| !a.outcome.passed()));
        for (i, attempt) in attempts.iter().enumerate() {
            assert_eq!(attempt.attempt, i as u32 + 1);
            assert_eq!(attempt.elapsed, Duration::from_secs(2) * i as u32);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn passes_once_the_check_succeeds() {
        let (engine, mock, id) = running("db").await;
        mock.script_exec("db", "pg_isready -U postgres", [2, 2, 0]);

        let probe = ReadinessProbe::exec(["pg_isready", "-U", "postgres"])
            .with_interval(Duration::from_secs(1))
            .with_max_retries(30);
        let report = engine.prober().probe(&id, &probe).await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.elapsed, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn refuses_to_probe_a_container_that_is_not_running() {
        let mock = Arc::new(MockBackend::new());
        let engine = Engine::boot(mock, Arc::new(MockImages::new()), EngineSettings::default()).await;
        let id = engine
            .containers()
            .create(ContainerConfig::new("redis:7").with_name("cache"))
            .await
            .unwrap();

        let result = engine.prober().probe(&id, &ReadinessProbe::tcp(6379)).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn network_probes_fail_without_an_address() {
        let (engine, _mock, id) = running("web").await;
        let probe = ReadinessProbe::http(8080, "/health")
            .with_interval(Duration::from_millis(10))
            .with_max_retries(2);

        assert!(matches!(
            engine.prober().probe(&id, &probe).await,
            Err(EngineError::ReadinessTimeout { attempts: 2, .. })
        ));
    }

    async fn serve_once(status_line: &'static str) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            assert!(request.starts_with(b"GET /health "));
            let response =
                format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn tcp_check_passes_against_a_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert_eq!(tcp_check(Ipv4Addr::LOCALHOST, port).await, ProbeOutcome::Passed);
    }

    #[tokio::test]
    async fn http_check_passes_on_a_success_status() {
        let port = serve_once("HTTP/1.1 200 OK").await;

        let outcome = http_check(
            &probe_client(),
            Ipv4Addr::LOCALHOST,
            port,
            "/health",
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Passed);
    }

    #[tokio::test]
    async fn http_check_counts_a_503_as_a_failed_attempt() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;

        let outcome = http_check(
            &probe_client(),
            Ipv4Addr::LOCALHOST,
            port,
            "health",
            Duration::from_secs(5),
        )
        .await;
        match outcome {
            ProbeOutcome::Failed(reason) => assert!(reason.contains("503"), "{reason}"),
            ProbeOutcome::Passed => panic!("a 503 answer must not pass"),
        }
    }
}
