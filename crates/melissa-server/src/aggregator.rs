//! Aggregator run loop
//!
//! ## Lifecycle
//!
//! ```text
//! startup ─► (restore checkpoint if restarting) ─► SERVER(rank, node)
//!    │
//!    ▼
//! loop ─┬─ control message ─► HELLO→ALIVE, JOB, DROP, STOP
//!       ├─ data message    ─► ingest, JOB-REQUEST on first contact,
//!       │                     SIMU-STATUS on first contact / first finish
//!       └─ housekeeping    ─► TIMEOUT for silent simulations, checkpoint
//! ```
//!
//! `DONE` is sent once every expected, non-dropped simulation is finished.
//! The loop returns after `STOP`, writing a last checkpoint.

use crate::checkpoint::{CheckpointStore, should_checkpoint};
use crate::error::{Result, ServerError};
use crate::simulation::{Receipt, Simulation};
use crate::table::SimulationTable;
use chrono::{DateTime, Utc};
use melissa_core::{
    ConnectionInfo, ControlEndpoint, DataMessage, DataReceiver, Message, ProcessStatus, ServerOptions,
    SimulationId,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default period of the housekeeping tick
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer of accepted timesteps. The statistics math lives behind this.
pub trait StatisticsSink: Send {
    fn update(&mut self, simulation: &Simulation, message: &DataMessage);

    fn finalize(&mut self, _table: &SimulationTable) {}
}

/// Sink that only logs what it receives
#[derive(Debug, Default)]
pub struct LoggingSink {
    updates: u64,
    values: u64,
}

impl LoggingSink {
    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl StatisticsSink for LoggingSink {
    fn update(&mut self, simulation: &Simulation, message: &DataMessage) {
        self.updates += 1;
        self.values += message.data.len() as u64;
        debug!(
            simulation_id = %simulation.id,
            field = %message.field,
            timestep = message.timestep,
            values = message.data.len(),
            "Timestep accepted"
        );
    }

    fn finalize(&mut self, table: &SimulationTable) {
        info!(
            updates = self.updates,
            values = self.values,
            finished = table.finished_count(),
            "Statistics sink finalized"
        );
    }
}

/// Aggregator startup parameters
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub options: ServerOptions,
    /// Job id the server ran under at study start; keys the checkpoint
    pub first_job_id: String,
    /// Restore the checkpoint before serving
    pub restart: bool,
    pub rank: i32,
    pub node_name: String,
    /// Data-plane addresses advertised in CONNECTION-RESPONSE
    pub data_endpoints: Vec<String>,
    pub housekeeping_interval: Duration,
}

impl AggregatorConfig {
    pub fn new(options: ServerOptions, first_job_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            options,
            first_job_id: first_job_id.into(),
            restart: false,
            rank: 0,
            node_name: node_name.into(),
            data_endpoints: Vec::new(),
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
        }
    }

    fn simulation_timeout(&self) -> Result<Duration> {
        seconds("simulation_timeout", self.options.simulation_timeout_secs)
    }

    fn checkpoint_interval(&self) -> Result<Duration> {
        seconds("checkpoint_interval", self.options.checkpoint_interval_secs)
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(ServerError::config(format!("{name} must be a positive number of seconds, got {value}"))),
    }
}

/// Summary returned when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorReport {
    pub finished: usize,
    pub expected: usize,
    pub accepted: u64,
    pub duplicates: u64,
    pub checkpoints: u32,
    pub restored: bool,
    /// `false` when the launcher went away without STOP
    pub stopped: bool,
}

pub struct Aggregator<S: StatisticsSink> {
    config: AggregatorConfig,
    simulation_timeout: Duration,
    checkpoint_interval: Duration,
    table: SimulationTable,
    store: CheckpointStore,
    sink: S,
    last_checkpoint: Option<DateTime<Utc>>,
    done_sent: bool,
    report: AggregatorReport,
}

impl<S: StatisticsSink> Aggregator<S> {
    /// Build the aggregator, restoring the checkpoint when `config.restart`
    pub async fn new(config: AggregatorConfig, sink: S) -> Result<Self> {
        let simulation_timeout = config.simulation_timeout()?;
        let checkpoint_interval = config.checkpoint_interval()?;
        if config.options.field_names.is_empty() {
            return Err(ServerError::config("field_names must not be empty"));
        }

        let store = CheckpointStore::new(&config.options.checkpoint_dir, &config.first_job_id);
        let mut report = AggregatorReport::default();

        let restored = if config.restart {
            match store.load().await? {
                Some(table) => Some(table),
                None => {
                    warn!(
                        path = %store.path().display(),
                        "Restart requested but no checkpoint found, starting empty"
                    );
                    None
                }
            }
        } else {
            None
        };
        report.restored = restored.is_some();

        let table = restored.unwrap_or_else(|| {
            SimulationTable::new(
                config.options.field_names.clone(),
                config.options.nb_time_steps,
                config.options.expected_simulations,
            )
        });

        info!(
            first_job_id = %config.first_job_id,
            restart = config.restart,
            known = table.len(),
            finished = table.finished_count(),
            expected = table.expected(),
            stats = ?config.options.stats.enabled(),
            "Aggregator initialized"
        );

        Ok(Self {
            config,
            simulation_timeout,
            checkpoint_interval,
            table,
            store,
            sink,
            last_checkpoint: None,
            done_sent: false,
            report,
        })
    }

    /// Content of every CONNECTION-RESPONSE
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            comm_size: self.config.data_endpoints.len().max(1) as u32,
            sobol: self.config.options.sobol,
            learning: self.config.options.learning,
            nb_parameters: self.config.options.nb_parameters,
            verbosity: self.config.options.verbosity,
            data_endpoints: self.config.data_endpoints.clone(),
        }
    }

    pub fn table(&self) -> &SimulationTable {
        &self.table
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Serve until STOP or until the launcher goes away
    pub async fn run(mut self, control: &ControlEndpoint, mut data: DataReceiver) -> Result<AggregatorReport> {
        control
            .send(Message::Server {
                rank: self.config.rank,
                node_name: self.config.node_name.clone(),
            })
            .await?;
        info!(node = %self.config.node_name, "Aggregator ready");

        self.check_done(control).await?;

        let mut ticker = tokio::time::interval(self.config.housekeeping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut data_open = true;

        loop {
            tokio::select! {
                message = control.recv() => {
                    let Some(message) = message else {
                        warn!("Launcher closed the control plane without STOP");
                        break;
                    };
                    if self.handle_control(control, message).await? {
                        self.report.stopped = true;
                        break;
                    }
                }
                message = data.recv(), if data_open => match message {
                    Some(message) => self.handle_data(control, message).await?,
                    None => {
                        debug!("Data plane closed");
                        data_open = false;
                    }
                },
                _ = ticker.tick() => self.housekeeping(control).await?,
            }
        }

        self.write_checkpoint().await;
        self.sink.finalize(&self.table);

        self.report.finished = self.table.finished_count();
        self.report.expected = self.table.expected();
        info!(
            finished = self.report.finished,
            expected = self.report.expected,
            accepted = self.report.accepted,
            duplicates = self.report.duplicates,
            "Aggregator stopped"
        );
        Ok(self.report)
    }

    /// Returns `true` on STOP
    async fn handle_control(&mut self, control: &ControlEndpoint, message: Message) -> Result<bool> {
        match message {
            Message::Hello => control.send(Message::Alive).await?,
            Message::Job {
                simulation_id,
                job_id,
                parameters,
            } => {
                debug!(
                    simulation_id = %simulation_id,
                    job_id = %job_id,
                    parameters = ?parameters,
                    "Received simulation metadata"
                );
                if !self.table.is_dropped(simulation_id) {
                    self.table
                        .set_parameters(simulation_id, job_id, parameters, Utc::now());
                }
            }
            Message::Drop {
                simulation_id,
                job_id,
            } => {
                if self.table.drop_simulation(simulation_id) {
                    warn!(
                        simulation_id = %simulation_id,
                        job_id = %job_id,
                        expected = self.table.expected(),
                        "Simulation dropped"
                    );
                    self.write_checkpoint().await;
                }
                self.check_done(control).await?;
            }
            Message::ConnectionRequest {
                simulation_id,
                comm_size,
            } => {
                debug!(simulation_id = %simulation_id, comm_size, "Connection request on control plane");
                control
                    .send(Message::ConnectionResponse(self.connection_info()))
                    .await?;
            }
            Message::Stop => {
                info!("Received STOP");
                return Ok(true);
            }
            other => debug!(kind = other.kind(), "Ignoring unexpected control message"),
        }
        Ok(false)
    }

    async fn handle_data(&mut self, control: &ControlEndpoint, message: DataMessage) -> Result<()> {
        let outcome = self.table.ingest(&message, Utc::now());
        let Some(receipt) = outcome.receipt else {
            return Ok(());
        };
        let id = message.simulation_id;

        if outcome.first_contact {
            control.send(Message::JobRequest { simulation_id: id }).await?;
            self.send_status(control, id, ProcessStatus::Running).await?;
        }

        match receipt {
            Receipt::Accepted => {
                self.report.accepted += 1;
                if let Some(simulation) = self.table.get(id) {
                    self.sink.update(simulation, &message);
                }
            }
            Receipt::Duplicate => self.report.duplicates += 1,
            Receipt::UnknownField | Receipt::OutOfRange => {}
        }

        if outcome.newly_finished {
            info!(
                simulation_id = %id,
                finished = self.table.finished_count(),
                expected = self.table.expected(),
                "Simulation finished"
            );
            // a finish the launcher has seen must survive a reboot
            self.write_checkpoint().await;
            self.send_status(control, id, ProcessStatus::Finished).await?;
            self.check_done(control).await?;
        }
        Ok(())
    }

    async fn housekeeping(&mut self, control: &ControlEndpoint) -> Result<()> {
        let now = Utc::now();
        for id in self.table.take_silent(now, self.simulation_timeout) {
            warn!(
                simulation_id = %id,
                timeout_secs = self.simulation_timeout.as_secs_f64(),
                "Simulation timed out"
            );
            control.send(Message::Timeout { simulation_id: id }).await?;
        }

        if should_checkpoint(self.last_checkpoint, now, self.checkpoint_interval) {
            self.write_checkpoint().await;
        }
        Ok(())
    }

    async fn send_status(&self, control: &ControlEndpoint, id: SimulationId, status: ProcessStatus) -> Result<()> {
        control
            .send(Message::SimuStatus {
                simulation_id: id,
                status,
            })
            .await?;
        Ok(())
    }

    async fn check_done(&mut self, control: &ControlEndpoint) -> Result<()> {
        if self.done_sent || !self.table.is_complete() {
            return Ok(());
        }
        let finished = self.table.finished_count();
        info!(finished, "All expected simulations finished");
        control
            .send(Message::Done {
                finished: finished as u32,
            })
            .await?;
        self.done_sent = true;
        Ok(())
    }

    /// Checkpoint failures are logged, the loop keeps serving
    async fn write_checkpoint(&mut self) {
        match self.store.save(&self.table).await {
            Ok(_) => {
                self.last_checkpoint = Some(Utc::now());
                self.report.checkpoints += 1;
            }
            Err(e) => warn!(error = %e, "Failed to write checkpoint"),
        }
    }
}
