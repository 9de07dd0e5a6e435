use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, WorkerEndpoint};
use crate::dashboard::{self, DashboardState};
use crate::error::Result;
use crate::network::{MasterNetwork, NetworkError, NetworkEvent};
use crate::protocol::auth::AuthManager;
use crate::protocol::message::{
    ErrorReport, Message, MessageType, ProgressUpdate, Ready, TaskRequest, TaskResult,
};
use crate::scheduler::{Assignment, LoadBalancer, PriorityTask, Scheduler, WorkerTelemetry};
use crate::store::{self, MemoryStore, TaskStore, WorkerRecord, WorkerStatus};
use crate::tls::ClientTls;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// The master's session manager.
///
/// Owns the scheduler and the outbound network and runs three loops next to
/// the event loop:
///
/// 1. **Scheduler tick** every `scheduler.interval_ms`, sending a
///    `task_request` for each assignment
/// 2. **Telemetry poll** every `network.telemetry_interval_secs`: a
///    `resource_request` per worker, renewal of sessions close to expiry and
///    a `heartbeat` every `network.heartbeat_interval_secs`
/// 3. **Connector** that dials configured workers that are not connected
///
/// When history retention is configured, an hourly pass drops finished tasks,
/// events and offline workers older than the retention window.
pub struct MasterNode {
    config: Config,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn TaskStore>,
    network: Arc<MasterNetwork>,
    records: Mutex<HashMap<String, WorkerRecord>>,
    shutdown: CancellationToken,
}

impl MasterNode {
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        auth: Arc<AuthManager>,
        tls: Option<ClientTls>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<NetworkEvent>) {
        let balancer = Arc::new(LoadBalancer::new(
            config.scheduler.balancer_options(),
            Arc::clone(&store),
        ));
        let scheduler = Arc::new(
            Scheduler::with_capacity(balancer, Arc::clone(&store), config.scheduler.max_queued_tasks)
                .with_finished_retention(config.scheduler.max_finished_tasks),
        );
        let (network, events) = MasterNetwork::new(
            auth,
            tls,
            config.network.network_options(),
            shutdown.clone(),
        );

        let node = Arc::new(Self {
            config,
            scheduler,
            store,
            network,
            records: Mutex::new(HashMap::new()),
            shutdown,
        });
        (node, events)
    }

    /// Master with an in-memory store, the configured token file and, when
    /// TLS is enabled, a TLS client.
    pub fn from_config(
        config: Config,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<NetworkEvent>)> {
        let auth = AuthManager::from_token_file(
            &config.security.auth_token_file,
            config.network.auth_options(),
        )?;
        let tls = if config.security.tls.enabled {
            Some(ClientTls::new(&config.security.tls)?)
        } else {
            None
        };
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        Ok(Self::new(config, store, Arc::new(auth), tls, shutdown))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn network(&self) -> &Arc<MasterNetwork> {
        &self.network
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Last known record of every worker that has connected.
    pub fn worker_records(&self) -> Vec<WorkerRecord> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<WorkerRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        list
    }

    pub fn dashboard_state(&self) -> DashboardState {
        DashboardState {
            scheduler: Arc::clone(&self.scheduler),
            network: Arc::clone(&self.network),
            default_priority: self.config.scheduler.default_priority,
        }
    }

    pub async fn connect_worker(&self, endpoint: &WorkerEndpoint) -> Result<(), NetworkError> {
        self.network
            .connect_worker(&endpoint.worker_id, &endpoint.address)
            .await
    }

    /// Run until shutdown. `api` serves the HTTP API when given.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<NetworkEvent>, api: Option<TcpListener>) {
        tracing::info!(
            strategy = %self.scheduler.balancer().strategy(),
            interval_ms = self.config.scheduler.interval_ms,
            workers = self.config.network.workers.len(),
            "Starting master"
        );

        let mut loops: Vec<JoinHandle<()>> = vec![
            tokio::spawn(Arc::clone(&self).scheduler_loop()),
            tokio::spawn(Arc::clone(&self).telemetry_loop()),
        ];
        if !self.config.network.workers.is_empty() {
            loops.push(tokio::spawn(Arc::clone(&self).connect_loop()));
        }
        if let Some(retention) = self.config.scheduler.history_retention() {
            loops.push(tokio::spawn(Arc::clone(&self).cleanup_loop(retention)));
        }
        if let Some(listener) = api {
            loops.push(tokio::spawn(dashboard::serve(
                listener,
                self.dashboard_state(),
                self.shutdown.clone(),
            )));
        }

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }

        // Nobody reads events past this point.
        events.close();
        self.network.disconnect_all("master shutting down").await;
        for handle in loops {
            let _ = handle.await;
        }
        tracing::info!("Master stopped");
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.scheduler.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for assignment in self.scheduler.tick() {
                self.dispatch(assignment).await;
            }
        }
    }

    /// Send a freshly assigned task. A failed send leaves the task RUNNING;
    /// the eviction that follows reports it as orphaned.
    async fn dispatch(&self, assignment: Assignment) {
        let Assignment { worker_id, task } = assignment;
        let task_id = task.id;
        let request = TaskRequest {
            task_id: task_id.to_string(),
            code: task.code,
            data: task.data,
            name: task.name,
        };
        let message = match Message::with_payload(MessageType::TaskRequest, &request) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to encode task request");
                return;
            }
        };
        if let Err(e) = self.network.send(&worker_id, &message).await {
            tracing::warn!(task_id = %task_id, worker_id, error = %e, "Failed to send task request");
        }
    }

    async fn telemetry_loop(self: Arc<Self>) {
        let network = &self.config.network;
        let mut ticker = interval(Duration::from_secs(network.telemetry_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_every = Duration::from_secs(network.heartbeat_interval_secs);
        let mut last_heartbeat = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let heartbeat_due = last_heartbeat.elapsed() >= heartbeat_every;
            if heartbeat_due {
                last_heartbeat = Instant::now();
            }

            for worker_id in self.network.connected_workers().await {
                if let Err(e) = self.network.renew_session(&worker_id).await {
                    tracing::warn!(worker_id, error = %e, "Re-authentication failed");
                    continue;
                }
                if heartbeat_due {
                    self.send(&worker_id, &Message::empty(MessageType::Heartbeat))
                        .await;
                }
                self.send(&worker_id, &Message::empty(MessageType::ResourceRequest))
                    .await;
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, retention: chrono::Duration) {
        let mut ticker = interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.scheduler.cleanup_before(Utc::now() - retention);
        }
    }

    async fn connect_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(
            self.config.network.telemetry_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for endpoint in &self.config.network.workers {
                if self.network.is_connected(&endpoint.worker_id).await {
                    continue;
                }
                if let Err(e) = self.connect_worker(endpoint).await {
                    tracing::warn!(
                        worker_id = %endpoint.worker_id,
                        address = %endpoint.address,
                        error = %e,
                        "Failed to connect to worker"
                    );
                }
            }
        }
    }

    async fn send(&self, worker_id: &str, message: &Message) {
        if let Err(e) = self.network.send(worker_id, message).await {
            tracing::warn!(worker_id, message_type = %message.kind, error = %e, "Failed to send message");
        }
    }

    async fn handle_event(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected { worker_id, address } => {
                self.update_record(&worker_id, |record| {
                    record.status = WorkerStatus::Online;
                    record.address = Some(address);
                });
            }
            NetworkEvent::Message { worker_id, message } => {
                self.handle_message(&worker_id, message).await;
            }
            NetworkEvent::Disconnected { worker_id, reason } => {
                self.worker_lost(&worker_id, &reason);
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, worker_id: &str, message: Message) {
        match message.kind {
            MessageType::Ready => {
                let Some(ready) = decode::<Ready>(worker_id, &message) else {
                    return;
                };
                if ready.worker_id != worker_id {
                    tracing::warn!(
                        worker_id,
                        announced = %ready.worker_id,
                        "Worker announced a different id, keeping the configured one"
                    );
                }
                let capacity = self.scheduler.balancer().declare_worker(
                    worker_id,
                    &ready.capabilities,
                    ready.max_concurrent_tasks,
                );
                tracing::info!(
                    worker_id,
                    max_concurrent_tasks = capacity.max_concurrent_tasks,
                    capabilities = ?ready.capabilities,
                    "Worker ready"
                );
                self.update_record(worker_id, |record| {
                    record.status = WorkerStatus::Online;
                    record.capabilities = ready.capabilities;
                });
                self.send(worker_id, &Message::empty(MessageType::ResourceRequest))
                    .await;
            }
            MessageType::ResourceData => {
                let Some(telemetry) = decode::<WorkerTelemetry>(worker_id, &message) else {
                    return;
                };
                self.scheduler
                    .balancer()
                    .register_worker(worker_id, &telemetry);
                self.update_record(worker_id, |record| {
                    record.status = WorkerStatus::Online;
                    record.telemetry = Some(telemetry);
                });
            }
            MessageType::HeartbeatResponse => {
                if !self.scheduler.balancer().touch_worker(worker_id) {
                    tracing::debug!(worker_id, "Heartbeat response from unregistered worker");
                }
            }
            MessageType::ProgressUpdate => {
                let Some(update) = decode::<ProgressUpdate>(worker_id, &message) else {
                    return;
                };
                if let Some(task_id) = parse_task_id(worker_id, &update.task_id) {
                    self.scheduler
                        .update_progress(&task_id, worker_id, update.progress);
                }
            }
            MessageType::TaskResult => {
                let Some(report) = decode::<TaskResult>(worker_id, &message) else {
                    return;
                };
                let Some(task_id) = parse_task_id(worker_id, &report.task_id) else {
                    return;
                };
                if let Err(e) = self
                    .scheduler
                    .record_result(&task_id, worker_id, &report.result)
                {
                    tracing::warn!(task_id = %task_id, worker_id, error = %e, "Ignoring task result");
                }
            }
            MessageType::Error => {
                if let Some(report) = decode::<ErrorReport>(worker_id, &message) {
                    self.worker_error(worker_id, report);
                }
            }
            kind => {
                tracing::warn!(worker_id, message_type = %kind, "Unexpected message from worker");
            }
        }
    }

    /// A worker refused a task: fail it and schedule a fresh attempt.
    fn worker_error(self: &Arc<Self>, worker_id: &str, report: ErrorReport) {
        let task_id = report
            .task_id
            .as_deref()
            .and_then(|id| parse_task_id(worker_id, id));
        let Some(task_id) = task_id else {
            tracing::warn!(worker_id, error = %report.error, "Worker reported an error");
            return;
        };

        match self.scheduler.fail_task(&task_id, worker_id, &report.error) {
            Ok(failed) => self.schedule_retry(failed),
            Err(e) => {
                tracing::warn!(task_id = %task_id, worker_id, error = %e, "Ignoring task error report");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, failed: PriorityTask) {
        let attempt = failed.task.attempt;
        let max_retries = self.config.scheduler.max_retries;
        if attempt >= max_retries {
            tracing::warn!(task_id = %failed.task.id, attempt, "Task failed on its last attempt");
            return;
        }

        let delay = self.config.scheduler.retry_delay(attempt);
        tracing::info!(
            task_id = %failed.task.id,
            attempt,
            delay_secs = delay.as_secs_f64(),
            "Scheduling task retry"
        );

        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = node.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match node.scheduler.resubmit(&failed) {
                Ok(id) => {
                    tracing::info!(task_id = %id, retry_of = %failed.task.id, "Task re-submitted");
                }
                Err(e) => {
                    tracing::warn!(task_id = %failed.task.id, error = %e, "Failed to re-submit task");
                }
            }
        });
    }

    fn worker_lost(&self, worker_id: &str, reason: &str) {
        let registered = self
            .scheduler
            .balancer()
            .unregister_worker(worker_id)
            .is_some();
        let orphaned = self.scheduler.running_on(worker_id);
        if !orphaned.is_empty() {
            tracing::warn!(
                worker_id,
                count = orphaned.len(),
                task_ids = ?orphaned,
                "Worker left with tasks still running"
            );
        }
        tracing::info!(worker_id, reason, registered, "Worker disconnected");
        self.update_record(worker_id, |record| record.status = WorkerStatus::Offline);
    }

    fn update_record(&self, worker_id: &str, update: impl FnOnce(&mut WorkerRecord)) {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        let record = records
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                address: None,
                status: WorkerStatus::Online,
                capabilities: Vec::new(),
                telemetry: None,
                last_seen: Utc::now(),
            });
        update(record);
        record.last_seen = Utc::now();
        store::persist_worker(self.store.as_ref(), record);
    }
}

fn decode<T: DeserializeOwned>(worker_id: &str, message: &Message) -> Option<T> {
    match message.payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(worker_id, message_type = %message.kind, error = %e, "Malformed message payload");
            None
        }
    }
}

fn parse_task_id(worker_id: &str, raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(worker_id, task_id = raw, "Unknown task id format");
            None
        }
    }
}
