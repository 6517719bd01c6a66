//! Process supervisor: owns every process spawned during one execution

use crate::runtime::process::{
    spawn_supervised, EventSender, ExitStatus, HandleId, ProcessConfig, ProcessError,
    ProcessHandle, ProcessMessage, StopRequest,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Entry {
    handle: ProcessHandle,
    stop: Arc<watch::Sender<StopRequest>>,
}

/// Spawns, tracks and terminates child processes
pub struct ProcessSupervisor {
    entries: Mutex<Vec<Entry>>,
    events: EventSender,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    /// Create a supervisor and the receiving end of its event stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessMessage>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self::with_events(events), rx)
    }

    /// Create a supervisor that reports to an existing event channel
    pub fn with_events(events: EventSender) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a process. Must be called from within a tokio runtime.
    pub fn spawn(&self, config: ProcessConfig) -> Result<ProcessHandle, ProcessError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (handle, stop) = spawn_supervised(id, config, self.events.clone())?;
        self.entries().push(Entry {
            handle: handle.clone(),
            stop: Arc::new(stop),
        });
        Ok(handle)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_sender(&self, id: HandleId) -> Option<Arc<watch::Sender<StopRequest>>> {
        self.entries()
            .iter()
            .find(|e| e.handle.id == id)
            .map(|e| Arc::clone(&e.stop))
    }

    /// Every handle spawned so far, in start order
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.entries().iter().map(|e| e.handle.clone()).collect()
    }

    /// Handles that have not exited for good
    pub fn running(&self) -> Vec<ProcessHandle> {
        self.entries()
            .iter()
            .filter(|e| !e.handle.is_finished())
            .map(|e| e.handle.clone())
            .collect()
    }

    pub fn handle(&self, id: HandleId) -> Option<ProcessHandle> {
        self.entries()
            .iter()
            .find(|e| e.handle.id == id)
            .map(|e| e.handle.clone())
    }

    /// Wait for a process to exit for good
    pub async fn wait(&self, id: HandleId) -> Result<ExitStatus, ProcessError> {
        let handle = self.handle(id).ok_or(ProcessError::UnknownHandle(id))?;
        Ok(handle.wait().await)
    }

    /// Ask a process to stop, force-killing it once `grace` has elapsed
    pub async fn terminate(&self, handle: &ProcessHandle, grace: Duration) -> ExitStatus {
        if handle.is_finished() {
            return handle.status();
        }
        let Some(stop) = self.stop_sender(handle.id) else {
            return handle.wait().await;
        };

        log::info!("[{}] Stopping process...", handle.name);
        stop.send_replace(StopRequest::Stop);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = handle.pid() {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::debug!("[{}] SIGTERM failed: {}", handle.name, e);
                }
            }
        }

        #[cfg(not(unix))]
        {
            stop.send_replace(StopRequest::Kill);
        }

        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(status) => status,
            Err(_) => {
                log::warn!(
                    "[{}] Process did not exit within {:?}, forcing kill",
                    handle.name,
                    grace
                );
                stop.send_replace(StopRequest::Kill);
                handle.wait().await
            }
        }
    }

    /// Terminate every running process concurrently, latest first
    pub async fn shutdown(&self, grace: Duration) {
        let mut running = self.running();
        if running.is_empty() {
            return;
        }
        running.reverse();

        log::info!("Stopping {} process(es)...", running.len());
        let stops = running.iter().map(|handle| self.terminate(handle, grace));
        let statuses = futures::future::join_all(stops).await;

        for (handle, status) in running.iter().zip(statuses) {
            log::debug!("[{}] Stopped ({})", handle.name, status);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sleeper(name: &str) -> ProcessConfig {
        ProcessConfig::new(name, "sleep").with_args(["30"])
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let handle = supervisor
            .spawn(ProcessConfig::new("ok", "sh").with_args(["-c", "exit 0"]))
            .unwrap();
        assert_eq!(supervisor.wait(handle.id).await.unwrap(), ExitStatus::Success);
        assert!(supervisor.running().is_empty());
        assert!(matches!(
            supervisor.wait(99).await,
            Err(ProcessError::UnknownHandle(99))
        ));
    }

    #[tokio::test]
    async fn test_handle_ids_are_distinct() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let a = supervisor.spawn(ProcessConfig::new("a", "true")).unwrap();
        let b = supervisor.spawn(ProcessConfig::new("b", "true")).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(supervisor.handles().len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_with_sigterm() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let handle = supervisor.spawn(sleeper("sleeper")).unwrap();

        let status = supervisor.terminate(&handle, Duration::from_secs(5)).await;
        assert_eq!(status, ExitStatus::Killed);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        let handle = supervisor
            .spawn(ProcessConfig::new("stubborn", "sh").with_args([
                "-c",
                "trap '' TERM; while true; do sleep 0.1; done",
            ]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let status = supervisor
            .terminate(&handle, Duration::from_millis(300))
            .await;
        assert_eq!(status, ExitStatus::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything_within_grace() {
        let (supervisor, _rx) = ProcessSupervisor::new();
        for name in ["gzserver", "gzclient", "rviz2"] {
            supervisor.spawn(sleeper(name)).unwrap();
        }
        assert_eq!(supervisor.running().len(), 3);

        let started = Instant::now();
        supervisor.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(supervisor.running().is_empty());
        for handle in supervisor.handles() {
            assert_eq!(handle.status(), ExitStatus::Killed);
        }
    }
}
