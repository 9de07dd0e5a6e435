use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::network::{MasterLink, WorkerEvent, WorkerNetwork};
use crate::protocol::auth::AuthManager;
use crate::protocol::message::{Message, MessageType, Ready, TaskRequest, TaskResult};
use crate::tls;
use crate::worker::{ProcessExecutor, ProgressReporter, ResourceProbe, SystemProbe, TaskExecutor};

/// The worker's session manager: announces itself once authenticated, runs
/// task requests through the executor and answers the master's polls.
pub struct WorkerNode {
    worker_id: String,
    capabilities: Vec<String>,
    max_concurrent_tasks: u32,
    executor: Arc<dyn TaskExecutor>,
    probe: Arc<dyn ResourceProbe>,
    link: MasterLink,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WorkerNode {
    pub fn new(
        worker_id: impl Into<String>,
        capabilities: Vec<String>,
        max_concurrent_tasks: u32,
        executor: Arc<dyn TaskExecutor>,
        probe: Arc<dyn ResourceProbe>,
        link: MasterLink,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let max_concurrent_tasks = max_concurrent_tasks.max(1);
        Arc::new(Self {
            worker_id: worker_id.into(),
            capabilities,
            max_concurrent_tasks,
            executor,
            probe,
            link,
            slots: Arc::new(Semaphore::new(max_concurrent_tasks as usize)),
            shutdown,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Executions currently holding a slot.
    pub fn active_tasks(&self) -> usize {
        self.max_concurrent_tasks as usize - self.slots.available_permits()
    }

    /// Serve masters on `listener` with the configured executor, host probe,
    /// token file and TLS settings until shutdown.
    pub async fn serve(
        config: &Config,
        worker_id: String,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let auth = Arc::new(AuthManager::from_token_file(
            &config.security.auth_token_file,
            config.network.auth_options(),
        )?);
        let acceptor = if config.security.tls.enabled {
            Some(tls::acceptor(&config.security.tls)?)
        } else {
            None
        };

        let (network, events) =
            WorkerNetwork::new(auth, acceptor, config.network.network_options());
        let node = Self::new(
            worker_id,
            config.executor.capabilities.clone(),
            config.executor.max_concurrent_tasks,
            Arc::new(ProcessExecutor::new(&config.executor)),
            Arc::new(SystemProbe::new()),
            network.link(),
            shutdown.clone(),
        );

        let accept = tokio::spawn(network.run(listener, shutdown));
        node.run(events).await;
        let _ = accept.await;
        Ok(())
    }

    /// Handle network events until shutdown or until the network stops.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) {
        tracing::info!(
            worker_id = %self.worker_id,
            max_concurrent_tasks = self.max_concurrent_tasks,
            capabilities = ?self.capabilities,
            "Starting worker"
        );

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                WorkerEvent::Authenticated => self.announce().await,
                WorkerEvent::Message(message) => self.handle_message(message).await,
                WorkerEvent::MasterDisconnected { reason } => {
                    tracing::info!(
                        reason,
                        active_tasks = self.active_tasks(),
                        "Master session ended"
                    );
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
    }

    async fn announce(&self) {
        let ready = Ready {
            worker_id: self.worker_id.clone(),
            capabilities: self.capabilities.clone(),
            max_concurrent_tasks: Some(self.max_concurrent_tasks),
        };
        match Message::with_payload(MessageType::Ready, &ready) {
            Ok(message) => self.send(&message).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode ready message"),
        }
        self.send_resources().await;
    }

    async fn send_resources(&self) {
        let snapshot = self.probe.snapshot();
        match Message::with_payload(MessageType::ResourceData, &snapshot) {
            Ok(message) => self.send(&message).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode resource data"),
        }
    }

    async fn send(&self, message: &Message) {
        if let Err(e) = self.link.send(message).await {
            tracing::warn!(message_type = %message.kind, error = %e, "Failed to send to master");
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        match message.kind {
            MessageType::TaskRequest => self.accept_task(&message).await,
            MessageType::ResourceRequest => self.send_resources().await,
            MessageType::Heartbeat => {
                let mut response = Message::empty(MessageType::HeartbeatResponse);
                response
                    .data
                    .insert("worker_id".to_string(), self.worker_id.clone().into());
                response
                    .data
                    .insert("active_tasks".to_string(), self.active_tasks().into());
                self.send(&response).await;
            }
            kind => tracing::debug!(message_type = %kind, "Ignoring message from master"),
        }
    }

    async fn accept_task(self: &Arc<Self>, message: &Message) {
        let request = match message.payload::<TaskRequest>() {
            Ok(request) => request,
            Err(e) => {
                let task_id = message.data.get("task_id").and_then(|v| v.as_str());
                tracing::warn!(task_id, error = %e, "Malformed task request");
                self.send(&Message::error(task_id, &format!("Invalid task request: {}", e)))
                    .await;
                return;
            }
        };

        if request.task_id.is_empty() {
            self.send(&Message::error(None, "Invalid task request: missing task_id"))
                .await;
            return;
        }
        if request.code.trim().is_empty() {
            tracing::warn!(task_id = %request.task_id, "Task request without code");
            self.send(&Message::error(
                Some(&request.task_id),
                "Invalid task request: missing code",
            ))
            .await;
            return;
        }

        tracing::info!(task_id = %request.task_id, name = %request.name, "Task accepted");
        let node = Arc::clone(self);
        tokio::spawn(async move { node.execute(request).await });
    }

    /// Run one task and report progress and the result to the master.
    async fn execute(self: Arc<Self>, request: TaskRequest) {
        let Ok(_slot) = Arc::clone(&self.slots).acquire_owned().await else {
            return;
        };
        let task_id = request.task_id.clone();
        self.send(&Message::progress(&task_id, 0)).await;

        let (reporter, mut progress) = ProgressReporter::channel();
        let forwarder = {
            let node = Arc::clone(&self);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let mut last = 0u8;
                while let Some(value) = progress.recv().await {
                    last = value;
                    node.send(&Message::progress(&task_id, value)).await;
                }
                last
            })
        };

        let result = self.executor.execute(&request, reporter).await;
        // The reporter is gone, so the forwarder drains and ends.
        let last = forwarder.await.unwrap_or(0);

        let final_progress = if result.success { 100 } else { last.min(99) };
        self.send(&Message::progress(&task_id, final_progress)).await;

        tracing::info!(
            task_id = %task_id,
            success = result.success,
            execution_time = result.execution_time,
            "Task finished"
        );
        let report = TaskResult { task_id, result };
        match Message::with_payload(MessageType::TaskResult, &report) {
            Ok(message) => self.send(&message).await,
            Err(e) => tracing::error!(task_id = %report.task_id, error = %e, "Failed to encode task result"),
        }
    }
}
