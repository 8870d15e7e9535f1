//! Reconciliation loops for the lattice Job and JobRun resources.
//!
//! A lattice Job is only a declaration; its controller just acknowledges the
//! spec. A JobRun is one invocation: it owns a single batch job created
//! lazily from the declared definition plus the run's command and
//! environment overrides, the same ownership shape a component build uses
//! for its build job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job as BatchJob;
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::owner;
use crate::crd::{
    ComponentDefinition, FailureInfo, Job, JobDefinition, JobRun, JobRunSpec, JobRunState,
    JobRunStatus, JobState, JobStatus, MAIN_COMPONENT,
};

/// Label tying a backing batch job to its job run.
pub const BATCH_JOB_RUN_LABEL: &str = "jobrun.lattice.dev/name";

pub async fn reconcile_job(obj: Arc<Job>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling Job");

    let api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);

    let state = if obj.metadata.deletion_timestamp.is_some() {
        JobState::Deleting
    } else {
        JobState::Stable
    };

    let status = JobStatus {
        state,
        observed_generation: obj.metadata.generation,
    };
    if obj.status.as_ref() != Some(&status) {
        super::patch_status(&api, &name, &status).await?;
    }

    Ok(Action::await_change())
}

pub fn job_error_policy(obj: Arc<Job>, error: &Error, ctx: Arc<Context>) -> Action {
    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("job", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        return Action::await_change();
    }
    Action::requeue(error.requeue_after())
}

pub async fn reconcile_job_run(obj: Arc<JobRun>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling JobRun");

    let api: Api<JobRun> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        // The backing batch job is garbage collected through its owner
        // reference.
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    if observed.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let lattice_jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let declared = match lattice_jobs.get(&obj.spec.job).await {
        Ok(job) => job,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            return Err(Error::Validation(format!(
                "{} invokes job {} which does not exist",
                obj.description(),
                obj.spec.job
            )));
        }
        Err(e) => return Err(Error::Kube(e)),
    };

    let batch_jobs: Api<BatchJob> = Api::namespaced(ctx.client.clone(), &namespace);
    let job = match batch_jobs.get(&name).await {
        Ok(job) => {
            if !owner::controlled_by(&job, &*obj) {
                return Err(Error::Contract(format!(
                    "batch job {}/{} exists but is not controlled by {}",
                    namespace,
                    name,
                    obj.description()
                )));
            }
            Some(job)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => None,
        Err(e) => return Err(Error::Kube(e)),
    };

    let job = match job {
        Some(job) => job,
        None => {
            let desired = run_job(&obj, &declared.spec.definition)?;
            info!(name = %name, job = %obj.spec.job, "Creating batch job for job run");
            match batch_jobs.create(&Default::default(), &desired).await {
                Ok(job) => job,
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    return Ok(Action::requeue(Duration::from_secs(1)));
                }
                Err(e) => return Err(Error::Kube(e)),
            }
        }
    };

    let status = next_status(&observed, &job);
    if status != observed {
        debug!(name = %name, state = %status.state, "Updating job run status");
        super::patch_status(&api, &name, &status).await?;
    }

    if status.state.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(30)))
    }
}

pub fn job_run_error_policy(obj: Arc<JobRun>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("jobrun", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Job run not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Compute the next run status from the backing batch job. Timestamps are
/// written exactly once.
pub fn next_status(observed: &JobRunStatus, job: &BatchJob) -> JobRunStatus {
    let job_status = job.status.clone().unwrap_or_default();
    let active = job_status.active.unwrap_or(0);
    let succeeded = job_status.succeeded.unwrap_or(0);
    let failed = job_status.failed.unwrap_or(0);

    let mut status = observed.clone();

    if succeeded > 0 {
        status.state = JobRunState::Succeeded;
        status.failure_info = None;
    } else if failed > 0 && active == 0 {
        status.state = JobRunState::Failed;
        status.failure_info = Some(FailureInfo::user("job exited nonzero"));
    } else if active > 0 {
        status.state = JobRunState::Running;
    } else {
        status.state = JobRunState::Queued;
    }

    if status.start_timestamp.is_none()
        && (status.state == JobRunState::Running || status.state.is_terminal())
    {
        status.start_timestamp = Some(Utc::now());
    }
    if status.completion_timestamp.is_none() && status.state.is_terminal() {
        status.completion_timestamp = Some(Utc::now());
    }

    status
}

/// The command and environment one invocation actually runs with: the run's
/// overrides over the declared defaults.
pub fn effective_invocation(
    definition: &JobDefinition,
    spec: &JobRunSpec,
) -> (Vec<String>, BTreeMap<String, String>) {
    let command = spec
        .command
        .clone()
        .unwrap_or_else(|| definition.command.clone());

    let mut environment = definition.environment.clone();
    if let Some(overrides) = &spec.environment {
        for (key, value) in overrides {
            environment.insert(key.clone(), value.clone());
        }
    }

    (command, environment)
}

/// The batch job backing a job run.
fn run_job(run: &JobRun, definition: &JobDefinition) -> Result<BatchJob, Error> {
    let name = run.name_any();

    let image = match definition.components.get(MAIN_COMPONENT) {
        Some(ComponentDefinition::DockerImage { image }) => image.clone(),
        Some(ComponentDefinition::GitRepository { .. }) => {
            return Err(Error::Validation(format!(
                "job {} main component has no built artifact",
                run.spec.job
            )));
        }
        None => {
            return Err(Error::Validation(format!(
                "job {} has no main component",
                run.spec.job
            )));
        }
    };

    let (command, environment) = effective_invocation(definition, &run.spec);
    let env: Vec<EnvVar> = environment
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let labels = [(BATCH_JOB_RUN_LABEL.to_string(), name.clone())]
        .into_iter()
        .collect();

    Ok(BatchJob {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: run.namespace(),
            labels: Some(labels),
            owner_references: run.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::batch::v1::JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some(image),
                        command: if command.is_empty() {
                            None
                        } else {
                            Some(command)
                        },
                        env: if env.is_empty() { None } else { Some(env) },
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> JobDefinition {
        JobDefinition {
            components: BTreeMap::from([(
                MAIN_COMPONENT.to_string(),
                ComponentDefinition::DockerImage {
                    image: "registry/migrate:1".to_string(),
                },
            )]),
            command: vec!["migrate".to_string(), "up".to_string()],
            environment: BTreeMap::from([
                ("DB".to_string(), "petflix".to_string()),
                ("TIMEOUT".to_string(), "30".to_string()),
            ]),
        }
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let spec = JobRunSpec {
            job: "migrations".to_string(),
            command: None,
            environment: None,
        };
        let (command, environment) = effective_invocation(&definition(), &spec);
        assert_eq!(command, vec!["migrate", "up"]);
        assert_eq!(environment["DB"], "petflix");
    }

    #[test]
    fn overrides_replace_command_and_merge_environment() {
        let spec = JobRunSpec {
            job: "migrations".to_string(),
            command: Some(vec!["migrate".to_string(), "down".to_string()]),
            environment: Some(BTreeMap::from([
                ("TIMEOUT".to_string(), "60".to_string()),
                ("DRY_RUN".to_string(), "1".to_string()),
            ])),
        };
        let (command, environment) = effective_invocation(&definition(), &spec);
        assert_eq!(command, vec!["migrate", "down"]);
        // Declared environment survives where not overridden.
        assert_eq!(environment["DB"], "petflix");
        assert_eq!(environment["TIMEOUT"], "60");
        assert_eq!(environment["DRY_RUN"], "1");
    }

    fn batch_job(active: i32, succeeded: i32, failed: i32) -> BatchJob {
        BatchJob {
            metadata: Default::default(),
            spec: None,
            status: Some(k8s_openapi::api::batch::v1::JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn run_states_follow_the_batch_job() {
        assert_eq!(
            next_status(&Default::default(), &batch_job(0, 0, 0)).state,
            JobRunState::Queued
        );
        assert_eq!(
            next_status(&Default::default(), &batch_job(1, 0, 0)).state,
            JobRunState::Running
        );
        assert_eq!(
            next_status(&Default::default(), &batch_job(0, 1, 0)).state,
            JobRunState::Succeeded
        );
        assert_eq!(
            next_status(&Default::default(), &batch_job(0, 0, 1)).state,
            JobRunState::Failed
        );
    }

    #[test]
    fn completion_timestamp_is_written_once() {
        let first = next_status(&Default::default(), &batch_job(0, 1, 0));
        let completed = first.completion_timestamp;
        assert!(completed.is_some());

        let second = next_status(&first, &batch_job(0, 1, 0));
        assert_eq!(second.completion_timestamp, completed);
    }

    #[test]
    fn run_job_requires_a_built_main_component() {
        let run = JobRun {
            metadata: ObjectMeta {
                name: Some("run-1".to_string()),
                namespace: Some("lattice-petflix".to_string()),
                ..Default::default()
            },
            spec: JobRunSpec {
                job: "migrations".to_string(),
                command: None,
                environment: None,
            },
            status: None,
        };

        let unbuilt = JobDefinition {
            components: BTreeMap::from([(
                MAIN_COMPONENT.to_string(),
                ComponentDefinition::GitRepository {
                    url: "https://example.com/repo.git".to_string(),
                    commit: "abc".to_string(),
                    base_image: None,
                    command: None,
                },
            )]),
            ..Default::default()
        };
        assert!(matches!(
            run_job(&run, &unbuilt),
            Err(Error::Validation(_))
        ));

        let job = run_job(&run, &definition()).unwrap();
        let containers = job.spec.unwrap().template.spec.unwrap().containers;
        assert_eq!(containers[0].image.as_deref(), Some("registry/migrate:1"));
    }
}
