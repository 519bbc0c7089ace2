//! Lifecycle of a single PostgreSQL cluster
//!
//! A [`PostgresCluster`] moves between three states:
//!
//! ```text
//! Uninitialized --init--> Stopped --start--> Running
//!                            ^                  |
//!                            +---stop / wait----+
//! ```
//!
//! Running `initdb` takes seconds while copying an initialized data directory
//! takes milliseconds, so tests should initialize a golden cluster once and
//! [`clone_to`](PostgresCluster::clone_to) it (or use a
//! [`TemplateStore`](crate::TemplateStore)) for every test.

use crate::config::{self, ConfigOpt, TEST_LOG_FILE_NAME};
use crate::copy;
use crate::error::{GhostgresError, Result, StateError};
use crate::observer::{self, FailureObserver};
use crate::process::{self, ExitOutcome, ServerProcess, ShutdownMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Port used when the configuration does not name a usable one
pub const DEFAULT_PORT: u16 = 5432;

/// Name of the rendered configuration file inside the data directory
pub const CONFIG_FILE_NAME: &str = "postgresql.conf";

const PASSWORD_FILE_NAME: &str = "postgres_pass";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Hook run once after a successful stop
pub type OnDestroy = Box<dyn FnOnce() -> std::io::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Uninitialized,
    /// Initialized, no server process
    Stopped,
    Running,
}

/// A single PostgreSQL cluster: its configuration, data directory and, while
/// running, the server process.
#[derive(Default, Serialize, Deserialize)]
pub struct PostgresCluster {
    /// Entries of the generated `postgresql.conf`, written in order as
    ///
    /// ```text
    /// key = value # comment
    /// ```
    #[serde(default)]
    pub config: Vec<ConfigOpt>,

    /// Directory in which to initialize the cluster. Also used as the unix
    /// socket directory.
    pub data_dir: PathBuf,

    /// Extra `initdb` arguments, e.g. `--auth trust` and `--nosync`
    #[serde(default)]
    pub init_opts: Vec<ConfigOpt>,

    /// Extra `postgres` arguments
    #[serde(default)]
    pub run_opts: Vec<ConfigOpt>,

    /// Directory containing the `initdb` and `postgres` binaries
    pub bin_dir: PathBuf,

    /// Superuser password
    #[serde(default)]
    pub password: String,

    #[serde(skip)]
    fail_with: Option<FailureObserver>,

    #[serde(skip)]
    process: Option<ServerProcess>,

    #[serde(skip)]
    on_destroy: Option<OnDestroy>,
}

impl std::fmt::Debug for PostgresCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCluster")
            .field("config", &self.config)
            .field("data_dir", &self.data_dir)
            .field("init_opts", &self.init_opts)
            .field("run_opts", &self.run_opts)
            .field("bin_dir", &self.bin_dir)
            .field("process", &self.process)
            .field("on_destroy", &self.on_destroy.is_some())
            .finish_non_exhaustive()
    }
}

impl PostgresCluster {
    pub fn new(data_dir: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            bin_dir: bin_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Vec<ConfigOpt>) -> Self {
        self.config = config;
        self
    }

    pub fn with_init_opts(mut self, opts: Vec<ConfigOpt>) -> Self {
        self.init_opts = opts;
        self
    }

    pub fn with_run_opts(mut self, opts: Vec<ConfigOpt>) -> Self {
        self.run_opts = opts;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Attach an observer that is shown every error this cluster returns
    pub fn with_observer(mut self, observer: FailureObserver) -> Self {
        self.fail_with = Some(observer);
        self
    }

    pub fn set_observer(&mut self, observer: Option<FailureObserver>) {
        self.fail_with = observer;
    }

    /// Run `hook` once, after the next successful [`stop`](Self::stop)
    pub fn set_on_destroy(&mut self, hook: OnDestroy) {
        self.on_destroy = Some(hook);
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        observer::report(self.fail_with.as_ref(), result)
    }

    /// Location of the generated `postgresql.conf`
    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    /// Whether the data directory holds an initialized cluster, signalled by
    /// the existence of the generated configuration file
    pub fn initialized(&self) -> bool {
        self.config_file().try_exists().unwrap_or(false)
    }

    /// Whether a server process has been started and not yet waited for.
    /// This says nothing about readiness; see
    /// [`wait_till_running`](Self::wait_till_running).
    pub fn running(&self) -> bool {
        self.process.is_some()
    }

    pub fn state(&self) -> ClusterState {
        if self.running() {
            ClusterState::Running
        } else if self.initialized() {
            ClusterState::Stopped
        } else {
            ClusterState::Uninitialized
        }
    }

    /// Process id of the running server
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ServerProcess::id)
    }

    /// Run `initdb` to create the cluster in the data directory and write the
    /// generated `postgresql.conf`.
    ///
    /// Fails if the directory already holds a cluster; use
    /// [`init_if_needed`](Self::init_if_needed) to skip existing clusters.
    /// The superuser password is handed to `initdb` through a private temporary
    /// file that is removed whether or not initialization succeeds.
    pub async fn init(&mut self) -> Result<()> {
        let result = self.try_init().await;
        self.report(result)
    }

    async fn try_init(&self) -> Result<()> {
        if self.initialized() {
            return Err(StateError::AlreadyInitialized.into());
        }

        info!("Initializing cluster in {:?}", self.data_dir);

        let scratch = tempfile::Builder::new().prefix("pg_init").tempdir()?;
        let password_file = scratch.path().join(PASSWORD_FILE_NAME);
        write_private(&password_file, self.password.as_bytes()).await?;

        let mut args = config::make_args(&self.init_opts);
        args.push("--pgdata".to_string());
        args.push(path_arg(&self.data_dir));
        args.push("--pwfile".to_string());
        args.push(path_arg(&password_file));

        let output = process::run_to_completion(&self.bin_dir.join("initdb"), &args).await?;
        debug!("initdb output: {}", output);
        scratch.close()?;

        write_private(
            &self.config_file(),
            config::render_config(&self.config).as_bytes(),
        )
        .await?;

        info!("Cluster initialized in {:?}", self.data_dir);
        Ok(())
    }

    /// Calls [`init`](Self::init) unless the cluster is already initialized
    pub async fn init_if_needed(&mut self) -> Result<()> {
        if self.initialized() {
            return Ok(());
        }
        self.init().await
    }

    /// Start the server. In addition to `run_opts` it is passed
    ///
    /// ```text
    /// -D <data_dir>                     # data directory
    /// -k <data_dir>                     # unix socket directory
    /// -c config_file=<data_dir>/postgresql.conf
    /// ```
    ///
    /// Returns once the process is launched, before it accepts connections.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.try_start();
        self.report(result)
    }

    fn try_start(&mut self) -> Result<()> {
        if !self.initialized() {
            return Err(StateError::NotInitialized.into());
        }
        if self.running() {
            return Err(StateError::AlreadyRunning.into());
        }

        let mut args = config::make_args(&self.run_opts);
        args.push("-D".to_string());
        args.push(path_arg(&self.data_dir));
        args.push("-k".to_string());
        args.push(path_arg(&self.data_dir));
        args.push("-c".to_string());
        args.push(format!("config_file={}", self.config_file().display()));

        let server = ServerProcess::spawn(&self.bin_dir.join("postgres"), &args)?;
        info!(
            "Started postgres (pid {:?}) for {:?}",
            server.id(),
            self.data_dir
        );
        self.process = Some(server);
        Ok(())
    }

    /// Wait up to `timeout` for the server to accept connections, polling for
    /// its unix socket every 10ms. Must be called after [`start`](Self::start).
    pub async fn wait_till_running(&self, timeout: Duration) -> Result<()> {
        let result = self.try_wait_till_running(timeout).await;
        self.report(result)
    }

    async fn try_wait_till_running(&self, timeout: Duration) -> Result<()> {
        if !self.running() {
            return Err(StateError::NotStarted.into());
        }

        let socket = self.socket_file();
        let started = Instant::now();
        loop {
            if tokio::fs::try_exists(&socket).await? {
                debug!("Socket {:?} appeared after {:?}", socket, started.elapsed());
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(GhostgresError::Timeout {
                    path: socket,
                    timeout,
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Wait for the server to exit. Useful to freeze a test and inspect the
    /// database, then stop it externally with `pg_ctl -D <data_dir> stop`.
    ///
    /// Exiting with a non-zero status is an error carrying the server output;
    /// termination by a signal is not. Cancel safe: dropping the future
    /// leaves the server running and still owned by this cluster.
    pub async fn wait(&mut self) -> Result<()> {
        let result = self.try_wait().await;
        self.report(result)
    }

    async fn try_wait(&mut self) -> Result<()> {
        let Some(server) = self.process.as_mut() else {
            return Err(StateError::NotRunning.into());
        };

        // The handle is cleared only once the exit status is in, so a dropped
        // wait leaves the server supervised
        let outcome = server.wait().await;
        self.process = None;

        match outcome? {
            ExitOutcome::Exited => info!("postgres for {:?} exited", self.data_dir),
            ExitOutcome::Signaled(sig) => info!(
                "postgres for {:?} terminated by signal {}",
                self.data_dir, sig
            ),
        }
        Ok(())
    }

    /// Smart shutdown: the server waits for existing connections to close.
    /// Does nothing if the server is not running.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_with(ShutdownMode::Smart).await
    }

    /// Stop the server using `mode`, wait for it to exit and then run the
    /// destroy hook, if any. Does nothing if the server is not running.
    pub async fn stop_with(&mut self, mode: ShutdownMode) -> Result<()> {
        let result = self.try_stop(mode).await;
        self.report(result)
    }

    async fn try_stop(&mut self, mode: ShutdownMode) -> Result<()> {
        let Some(server) = self.process.as_ref() else {
            return Ok(());
        };
        if let Err(e) = server.signal(mode) {
            warn!("Failed to signal postgres for {:?}: {}", self.data_dir, e);
        }

        self.try_wait().await?;

        if let Some(hook) = self.on_destroy.take() {
            debug!("Running destroy hook for {:?}", self.data_dir);
            hook()?;
        }
        Ok(())
    }

    /// Send the server the signal for `mode` without waiting for it to exit
    pub fn signal(&self, mode: ShutdownMode) -> Result<()> {
        let result = match &self.process {
            Some(server) => server.signal(mode),
            None => Err(StateError::NotRunning.into()),
        };
        self.report(result)
    }

    /// Copy the data directory to `dest` and return a cluster using the copy.
    ///
    /// The cluster must be initialized and stopped, and `dest` must not exist.
    /// The clone shares this cluster's settings and observer but not its
    /// destroy hook.
    pub async fn clone_to(&self, dest: impl AsRef<Path>) -> Result<PostgresCluster> {
        let result = self.try_clone_to(dest.as_ref()).await;
        self.report(result)
    }

    async fn try_clone_to(&self, dest: &Path) -> Result<PostgresCluster> {
        if self.running() {
            return Err(StateError::CloneRunning.into());
        }
        if !self.initialized() {
            return Err(StateError::CloneUninitialized.into());
        }
        if tokio::fs::try_exists(dest).await? {
            return Err(StateError::DestinationExists(dest.to_path_buf()).into());
        }

        let started = Instant::now();
        copy::copy_tree(&self.data_dir, dest).await?;
        info!(
            "Cloned {:?} into {:?} in {:?}",
            self.data_dir,
            dest,
            started.elapsed()
        );

        Ok(self.with_data_dir(dest.to_path_buf()))
    }

    /// Same settings, different data directory, not running
    pub(crate) fn with_data_dir(&self, data_dir: PathBuf) -> PostgresCluster {
        PostgresCluster {
            config: self.config.clone(),
            data_dir,
            init_opts: self.init_opts.clone(),
            run_opts: self.run_opts.clone(),
            bin_dir: self.bin_dir.clone(),
            password: self.password.clone(),
            fail_with: self.fail_with.clone(),
            process: None,
            on_destroy: None,
        }
    }

    /// The first `port` entry of the configuration
    pub fn try_port(&self) -> Result<u16> {
        let opt = self
            .config
            .iter()
            .find(|opt| opt.key == "port")
            .ok_or_else(|| GhostgresError::Configuration("no port configured".to_string()))?;
        opt.value.parse::<u16>().map_err(|e| {
            GhostgresError::Configuration(format!("invalid port {:?}: {}", opt.value, e))
        })
    }

    /// The configured port, or 5432 when it is missing or unparsable. The
    /// failure is reported to the observer.
    pub fn port(&self) -> u16 {
        match self.try_port() {
            Ok(port) => port,
            Err(e) => {
                debug!("Falling back to port {}: {}", DEFAULT_PORT, e);
                let _ = self.report::<u16>(Err(e));
                DEFAULT_PORT
            }
        }
    }

    /// The unix socket directory, which is the data directory
    pub fn socket_dir(&self) -> PathBuf {
        std::path::absolute(&self.data_dir).unwrap_or_else(|_| self.data_dir.clone())
    }

    /// The unix socket the server listens on
    pub fn socket_file(&self) -> PathBuf {
        self.socket_dir().join(format!(".s.PGSQL.{}", self.port()))
    }

    /// libpq-style connection parameters for the unix socket
    pub fn connect_string(&self) -> String {
        format!(
            "host={} port={} sslmode=disable",
            self.socket_dir().display(),
            self.port()
        )
    }

    /// Server log written when [`logging_config`](crate::config::logging_config) is used
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("pg_log").join(TEST_LOG_FILE_NAME)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Write `contents` to `path` readable only by the owner
async fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await?;
    Ok(())
}
