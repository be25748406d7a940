//! Study hooks
//!
//! [`StudyHooks`] is the capability interface the study drives. Mandatory
//! hooks have no default; a failure in any of them aborts the study.
//! Optional hooks default to no-ops (or to "relaunch" for the restart hooks)
//! and their failures are only logged.
//!
//! Two implementations ship with the launcher:
//!
//! - [`SchedulerHooks`]: mandatory hooks backed by a [`Scheduler`] adapter,
//!   used by the `melissa-launcher` binary
//! - [`FunctionHooks`]: a table of closures, built from [`UserFunctions`]
//!   which checks at construction that every mandatory hook is present

use crate::error::{LauncherError, Result};
use crate::job::GroupRecord;
use crate::scheduler::{CommandSpec, Job, Scheduler, SubmitRequest};
use async_trait::async_trait;
use futures::future::BoxFuture;
use melissa_core::{CouplingMode, DEFAULT_DATA_PORT, GroupId, JobId, SimulationId};
use std::path::PathBuf;
use tracing::{error, info};

/// What a server (re)launch needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct ServerLaunch {
    pub options_string: String,
    /// Set on reboots, the server restores the checkpoint written under it
    pub first_job_id: Option<JobId>,
    pub restart: bool,
}

/// What a group (re)launch needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLaunch {
    pub group: GroupId,
    pub simulations: Vec<SimulationId>,
    /// Parallel to `simulations`
    pub parameters: Vec<Vec<f64>>,
    pub coupling: CouplingMode,
    pub nb_restarts: u32,
    /// Node of the running aggregator
    pub server_node: Option<String>,
}

impl GroupLaunch {
    pub fn from_record(group: &GroupRecord, server_node: Option<String>) -> Self {
        Self {
            group: group.id,
            simulations: group.simulations.clone(),
            parameters: group.parameters.clone(),
            coupling: group.coupling,
            nb_restarts: group.nb_restarts,
            server_node,
        }
    }
}

/// Hooks the study calls
#[async_trait]
pub trait StudyHooks: Send + Sync {
    async fn launch_server(&self, server: &ServerLaunch) -> anyhow::Result<Job>;

    async fn launch_group(&self, group: &GroupLaunch) -> anyhow::Result<Job>;

    /// Refresh the scheduler state of the server job in place
    async fn check_server_job(&self, job: &mut Job) -> anyhow::Result<()>;

    /// Refresh the scheduler state of a group job in place
    async fn check_group_job(&self, job: &mut Job) -> anyhow::Result<()>;

    async fn cancel_job(&self, jobs: &[JobId]) -> anyhow::Result<()>;

    async fn create_study(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_group(&self, _group: &GroupLaunch) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` falls back to uniform sampling
    async fn draw_parameter_set(&self, _nb_parameters: u32) -> anyhow::Result<Option<Vec<f64>>> {
        Ok(None)
    }

    /// `None` relaunches through `launch_server`
    async fn restart_server(&self, _server: &ServerLaunch) -> anyhow::Result<Option<Job>> {
        Ok(None)
    }

    /// `None` relaunches through `launch_group`
    async fn restart_group(&self, _group: &GroupLaunch) -> anyhow::Result<Option<Job>> {
        Ok(None)
    }

    /// `false` holds submissions back until the queue drains
    async fn check_scheduler_load(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn postprocessing(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn finalize(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Executable and resources of one kind of job
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableSpec {
    pub program: String,
    pub ranks: u32,
    /// Raw scheduler arguments for this kind of job
    pub scheduler_args: Vec<String>,
}

impl ExecutableSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ranks: 1,
            scheduler_args: Vec::new(),
        }
    }
}

/// Default hooks: submit through a scheduler adapter
pub struct SchedulerHooks {
    scheduler: Box<dyn Scheduler>,
    server: ExecutableSpec,
    simulation: ExecutableSpec,
    launcher_address: String,
    data_port: u16,
    output_dir: Option<PathBuf>,
}

impl SchedulerHooks {
    pub fn new(
        scheduler: Box<dyn Scheduler>,
        server: ExecutableSpec,
        simulation: ExecutableSpec,
        launcher_address: impl Into<String>,
    ) -> Self {
        Self {
            scheduler,
            server,
            simulation,
            launcher_address: launcher_address.into(),
            data_port: DEFAULT_DATA_PORT,
            output_dir: None,
        }
    }

    /// Port the aggregator binds its data plane on
    pub fn with_data_port(mut self, port: u16) -> Self {
        self.data_port = port;
        self
    }

    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn server_request(&self, server: &ServerLaunch) -> SubmitRequest {
        let mut args = vec![
            "--launcher".to_string(),
            self.launcher_address.clone(),
            "--options".to_string(),
            server.options_string.clone(),
            "--bind".to_string(),
            format!("0.0.0.0:{}", self.data_port),
        ];
        if server.restart {
            args.push("--restart".to_string());
        }
        if let Some(first) = &server.first_job_id {
            args.push("--first-job-id".to_string());
            args.push(first.to_string());
        }

        SubmitRequest::new(
            "melissa-server",
            vec![CommandSpec::new(&self.server.program, args).with_ranks(self.server.ranks)],
        )
        .env("MELISSA_LAUNCHER", &self.launcher_address)
        .with_options(self.server.scheduler_args.clone())
        .with_output_dir(self.output_dir.clone())
    }

    /// One command per simulation: `<program> <simulation id> <parameters...>`
    pub fn group_request(&self, group: &GroupLaunch) -> SubmitRequest {
        let commands = group
            .simulations
            .iter()
            .zip(&group.parameters)
            .map(|(id, parameters)| {
                let args = std::iter::once(id.to_string())
                    .chain(parameters.iter().map(|p| p.to_string()))
                    .collect();
                CommandSpec::new(&self.simulation.program, args).with_ranks(self.simulation.ranks)
            })
            .collect();

        let mut request = SubmitRequest::new(format!("melissa-group-{}", group.group), commands)
            .env("MELISSA_LAUNCHER", &self.launcher_address)
            .env("MELISSA_COUPLING", group.coupling.to_string())
            .env("MELISSA_SERVER_PORT", self.data_port.to_string())
            .with_options(self.simulation.scheduler_args.clone())
            .with_output_dir(self.output_dir.clone());
        if let Some(node) = &group.server_node {
            request = request.env("MELISSA_SERVER_NODE_NAME", node);
        }
        if group.coupling == CouplingMode::Custom {
            let dir = self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let rendezvous = dir.join(format!("group-{}.rendezvous", group.group));
            request = request.env("MELISSA_RENDEZVOUS", rendezvous.display().to_string());
        }
        request
    }
}

#[async_trait]
impl StudyHooks for SchedulerHooks {
    async fn launch_server(&self, server: &ServerLaunch) -> anyhow::Result<Job> {
        Ok(self.scheduler.submit(&self.server_request(server)).await?)
    }

    async fn launch_group(&self, group: &GroupLaunch) -> anyhow::Result<Job> {
        Ok(self.scheduler.submit(&self.group_request(group)).await?)
    }

    async fn check_server_job(&self, job: &mut Job) -> anyhow::Result<()> {
        Ok(self.scheduler.update_status(std::slice::from_mut(job)).await?)
    }

    async fn check_group_job(&self, job: &mut Job) -> anyhow::Result<()> {
        Ok(self.scheduler.update_status(std::slice::from_mut(job)).await?)
    }

    async fn cancel_job(&self, jobs: &[JobId]) -> anyhow::Result<()> {
        Ok(self.scheduler.cancel(jobs).await?)
    }
}

type HookFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

pub type LaunchServerFn = Box<dyn Fn(ServerLaunch) -> HookFuture<Job> + Send + Sync>;
pub type LaunchGroupFn = Box<dyn Fn(GroupLaunch) -> HookFuture<Job> + Send + Sync>;
/// Receives the job and returns it with a refreshed state
pub type CheckJobFn = Box<dyn Fn(Job) -> HookFuture<Job> + Send + Sync>;
pub type CancelJobFn = Box<dyn Fn(Vec<JobId>) -> HookFuture<()> + Send + Sync>;
pub type UnitFn = Box<dyn Fn() -> HookFuture<()> + Send + Sync>;
pub type CreateGroupFn = Box<dyn Fn(GroupLaunch) -> HookFuture<()> + Send + Sync>;
pub type DrawFn = Box<dyn Fn(u32) -> HookFuture<Option<Vec<f64>>> + Send + Sync>;
pub type RestartServerFn = Box<dyn Fn(ServerLaunch) -> HookFuture<Option<Job>> + Send + Sync>;
pub type RestartGroupFn = Box<dyn Fn(GroupLaunch) -> HookFuture<Option<Job>> + Send + Sync>;
pub type LoadFn = Box<dyn Fn() -> HookFuture<bool> + Send + Sync>;

/// Named hook table, validated by [`UserFunctions::build`]
#[derive(Default)]
pub struct UserFunctions {
    pub launch_server: Option<LaunchServerFn>,
    pub launch_group: Option<LaunchGroupFn>,
    pub check_server_job: Option<CheckJobFn>,
    pub check_group_job: Option<CheckJobFn>,
    pub cancel_job: Option<CancelJobFn>,
    pub create_study: Option<UnitFn>,
    pub create_group: Option<CreateGroupFn>,
    pub draw_parameter_set: Option<DrawFn>,
    pub restart_server: Option<RestartServerFn>,
    pub restart_group: Option<RestartGroupFn>,
    pub check_scheduler_load: Option<LoadFn>,
    pub postprocessing: Option<UnitFn>,
    pub finalize: Option<UnitFn>,
}

impl UserFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the mandatory hooks that are not set
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.launch_server.is_none(), "launch_server"),
            (self.launch_group.is_none(), "launch_group"),
            (self.check_server_job.is_none(), "check_server_job"),
            (self.check_group_job.is_none(), "check_group_job"),
            (self.cancel_job.is_none(), "cancel_job"),
        ]
        .into_iter()
        .filter_map(|(missing, name)| missing.then_some(name))
        .collect()
    }

    /// Validate and freeze the table. Every missing hook is logged.
    pub fn build(self) -> Result<FunctionHooks> {
        let missing = self.missing();
        for name in &missing {
            error!("Missing mandatory user function: {}", name);
        }
        let (
            Some(launch_server),
            Some(launch_group),
            Some(check_server_job),
            Some(check_group_job),
            Some(cancel_job),
        ) = (
            self.launch_server,
            self.launch_group,
            self.check_server_job,
            self.check_group_job,
            self.cancel_job,
        )
        else {
            return Err(LauncherError::Config { count: missing.len() });
        };

        let optional = [
            ("create_study", self.create_study.is_some()),
            ("create_group", self.create_group.is_some()),
            ("draw_parameter_set", self.draw_parameter_set.is_some()),
            ("restart_server", self.restart_server.is_some()),
            ("restart_group", self.restart_group.is_some()),
            ("check_scheduler_load", self.check_scheduler_load.is_some()),
            ("postprocessing", self.postprocessing.is_some()),
            ("finalize", self.finalize.is_some()),
        ];
        let provided: Vec<&str> = optional.iter().filter(|(_, p)| *p).map(|(n, _)| *n).collect();
        info!(optional = ?provided, "User functions validated");

        Ok(FunctionHooks {
            launch_server,
            launch_group,
            check_server_job,
            check_group_job,
            cancel_job,
            create_study: self.create_study,
            create_group: self.create_group,
            draw_parameter_set: self.draw_parameter_set,
            restart_server: self.restart_server,
            restart_group: self.restart_group,
            check_scheduler_load: self.check_scheduler_load,
            postprocessing: self.postprocessing,
            finalize: self.finalize,
        })
    }
}

/// Validated closure table
pub struct FunctionHooks {
    launch_server: LaunchServerFn,
    launch_group: LaunchGroupFn,
    check_server_job: CheckJobFn,
    check_group_job: CheckJobFn,
    cancel_job: CancelJobFn,
    create_study: Option<UnitFn>,
    create_group: Option<CreateGroupFn>,
    draw_parameter_set: Option<DrawFn>,
    restart_server: Option<RestartServerFn>,
    restart_group: Option<RestartGroupFn>,
    check_scheduler_load: Option<LoadFn>,
    postprocessing: Option<UnitFn>,
    finalize: Option<UnitFn>,
}

#[async_trait]
impl StudyHooks for FunctionHooks {
    async fn launch_server(&self, server: &ServerLaunch) -> anyhow::Result<Job> {
        (self.launch_server)(server.clone()).await
    }

    async fn launch_group(&self, group: &GroupLaunch) -> anyhow::Result<Job> {
        (self.launch_group)(group.clone()).await
    }

    async fn check_server_job(&self, job: &mut Job) -> anyhow::Result<()> {
        *job = (self.check_server_job)(job.clone()).await?;
        Ok(())
    }

    async fn check_group_job(&self, job: &mut Job) -> anyhow::Result<()> {
        *job = (self.check_group_job)(job.clone()).await?;
        Ok(())
    }

    async fn cancel_job(&self, jobs: &[JobId]) -> anyhow::Result<()> {
        (self.cancel_job)(jobs.to_vec()).await
    }

    async fn create_study(&self) -> anyhow::Result<()> {
        match &self.create_study {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn create_group(&self, group: &GroupLaunch) -> anyhow::Result<()> {
        match &self.create_group {
            Some(f) => f(group.clone()).await,
            None => Ok(()),
        }
    }

    async fn draw_parameter_set(&self, nb_parameters: u32) -> anyhow::Result<Option<Vec<f64>>> {
        match &self.draw_parameter_set {
            Some(f) => f(nb_parameters).await,
            None => Ok(None),
        }
    }

    async fn restart_server(&self, server: &ServerLaunch) -> anyhow::Result<Option<Job>> {
        match &self.restart_server {
            Some(f) => f(server.clone()).await,
            None => Ok(None),
        }
    }

    async fn restart_group(&self, group: &GroupLaunch) -> anyhow::Result<Option<Job>> {
        match &self.restart_group {
            Some(f) => f(group.clone()).await,
            None => Ok(None),
        }
    }

    async fn check_scheduler_load(&self) -> anyhow::Result<bool> {
        match &self.check_scheduler_load {
            Some(f) => f().await,
            None => Ok(true),
        }
    }

    async fn postprocessing(&self) -> anyhow::Result<()> {
        match &self.postprocessing {
            Some(f) => f().await,
            None => Ok(()),
        }
    }

    async fn finalize(&self) -> anyhow::Result<()> {
        match &self.finalize {
            Some(f) => f().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::LocalScheduler;
    use futures::FutureExt;
    use melissa_core::JobState;

    fn group_launch() -> GroupLaunch {
        GroupLaunch {
            group: GroupId(3),
            simulations: vec![SimulationId(12), SimulationId(13)],
            parameters: vec![vec![0.25, 0.5], vec![0.75, 0.5]],
            coupling: CouplingMode::Custom,
            nb_restarts: 0,
            server_node: Some("node9".into()),
        }
    }

    #[test]
    fn test_missing_mandatory_hooks_counted() {
        let mut functions = UserFunctions::new();
        functions.cancel_job = Some(Box::new(|_| async { Ok(()) }.boxed()));
        assert_eq!(functions.missing().len(), 4);
        assert!(matches!(functions.build(), Err(LauncherError::Config { count: 4 })));
    }

    #[tokio::test]
    async fn test_function_hooks_dispatch() {
        let functions = UserFunctions {
            launch_server: Some(Box::new(|_| async { Ok(Job::new(JobId::new("s"), JobState::Running)) }.boxed())),
            launch_group: Some(Box::new(|g: GroupLaunch| {
                async move { Ok(Job::new(JobId::new(format!("g{}", g.group)), JobState::Waiting)) }.boxed()
            })),
            check_server_job: Some(Box::new(|job| async move { Ok(job) }.boxed())),
            check_group_job: Some(Box::new(|mut job: Job| {
                async move {
                    job.state = JobState::Terminated;
                    Ok(job)
                }
                .boxed()
            })),
            cancel_job: Some(Box::new(|_| async { Ok(()) }.boxed())),
            check_scheduler_load: Some(Box::new(|| async { Ok(false) }.boxed())),
            ..Default::default()
        };
        let hooks = functions.build().unwrap();

        let mut job = hooks.launch_group(&group_launch()).await.unwrap();
        assert_eq!(job.id, JobId::new("g3"));
        hooks.check_group_job(&mut job).await.unwrap();
        assert_eq!(job.state, JobState::Terminated);

        assert!(!hooks.check_scheduler_load().await.unwrap());
        assert_eq!(hooks.draw_parameter_set(2).await.unwrap(), None);
        assert_eq!(hooks.restart_group(&group_launch()).await.unwrap(), None);
    }

    #[test]
    fn test_group_request() {
        let hooks = SchedulerHooks::new(
            Box::new(LocalScheduler::new()),
            ExecutableSpec::new("melissa-server"),
            ExecutableSpec::new("./heat"),
            "login1:5555",
        )
        .with_output_dir(Some(PathBuf::from("/scratch/study")));

        let request = hooks.group_request(&group_launch());
        assert_eq!(request.name, "melissa-group-3");
        assert!(request.is_heterogeneous());
        assert_eq!(request.commands[0].args, vec!["12", "0.25", "0.5"]);
        assert_eq!(request.commands[1].args, vec!["13", "0.75", "0.5"]);
        assert!(request.environment.contains(&("MELISSA_SERVER_NODE_NAME".into(), "node9".into())));
        assert!(request.environment.contains(&("MELISSA_SERVER_PORT".into(), "5556".into())));
        assert!(request.environment.contains(&(
            "MELISSA_RENDEZVOUS".into(),
            "/scratch/study/group-3.rendezvous".into()
        )));
    }

    #[test]
    fn test_server_request_on_reboot() {
        let hooks = SchedulerHooks::new(
            Box::new(LocalScheduler::new()),
            ExecutableSpec::new("melissa-server"),
            ExecutableSpec::new("./heat"),
            "login1:5555",
        );
        let request = hooks.server_request(&ServerLaunch {
            options_string: "{}".into(),
            first_job_id: Some(JobId::new("77")),
            restart: true,
        });
        assert_eq!(
            request.commands[0].args,
            vec![
                "--launcher",
                "login1:5555",
                "--options",
                "{}",
                "--bind",
                "0.0.0.0:5556",
                "--restart",
                "--first-job-id",
                "77"
            ]
        );
    }

    #[test]
    fn test_data_port_shared_by_server_and_groups() {
        let hooks = SchedulerHooks::new(
            Box::new(LocalScheduler::new()),
            ExecutableSpec::new("melissa-server"),
            ExecutableSpec::new("./heat"),
            "login1:5555",
        )
        .with_data_port(6100);

        let server = hooks.server_request(&ServerLaunch {
            options_string: "{}".into(),
            first_job_id: None,
            restart: false,
        });
        let bind = server.commands[0].args.iter().position(|arg| arg == "--bind").unwrap();
        assert_eq!(server.commands[0].args[bind + 1], "0.0.0.0:6100");

        let group = hooks.group_request(&group_launch());
        assert!(group.environment.contains(&("MELISSA_SERVER_PORT".into(), "6100".into())));
        assert!(group.environment.contains(&("MELISSA_SERVER_NODE_NAME".into(), "node9".into())));
    }
}
