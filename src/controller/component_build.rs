//! Reconciliation loop for ComponentBuild.
//!
//! A component build owns exactly one batch Job, created lazily on first
//! sync. The build executor running inside the job annotates the job with
//! the image it produced; the reconciler reflects the job's terminal state
//! (and that artifact) back onto the ComponentBuild status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job as BatchJob, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::owner;
use crate::crd::{
    ComponentBuild, ComponentBuildArtifacts, ComponentBuildState, ComponentBuildStatus,
    ComponentBuilderConfig, FailureInfo, BUILD_FAILURE_INFO_ANNOTATION,
    DOCKER_IMAGE_FQN_ANNOTATION,
};

/// Label tying the backing job to its component build.
pub const JOB_COMPONENT_BUILD_LABEL: &str = "componentbuild.lattice.dev/name";

pub async fn reconcile(obj: Arc<ComponentBuild>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::MissingField("namespace".to_string()))?;

    debug!(name = %name, namespace = %namespace, "Reconciling ComponentBuild");

    let api: Api<ComponentBuild> = Api::namespaced(ctx.client.clone(), &namespace);

    // Orphaned builds are deleted outright, before any normal sync. The
    // parent service build is gone, so nothing will ever consume the result.
    if owner::orphaned(&*obj) && obj.metadata.deletion_timestamp.is_none() {
        info!(name = %name, "Deleting orphaned component build");
        match api.delete(&name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(Error::Kube(e)),
        }
        return Ok(Action::await_change());
    }

    if obj.metadata.deletion_timestamp.is_some() {
        // The backing job is garbage collected through its owner reference.
        return Ok(Action::await_change());
    }

    let observed = obj.status.clone().unwrap_or_default();
    if observed.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let jobs: Api<BatchJob> = Api::namespaced(ctx.client.clone(), &namespace);
    let job = match jobs.get(&name).await {
        Ok(job) => {
            if !owner::controlled_by(&job, &*obj) {
                return Err(Error::Contract(format!(
                    "job {}/{} exists but is not controlled by {}",
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
            let builder = ctx.config_snapshot()?.component_builder;
            let desired = build_job(&obj, &builder)?;
            info!(name = %name, "Creating build job");
            match jobs.create(&Default::default(), &desired).await {
                Ok(job) => job,
                // Another worker won the create race; pick the job up on
                // the next pass.
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    return Ok(Action::requeue(Duration::from_secs(1)));
                }
                Err(e) => return Err(Error::Kube(e)),
            }
        }
    };

    let status = next_status(&observed, &job)?;
    if status != observed {
        debug!(name = %name, state = %status.state, "Updating component build status");
        super::patch_status(&api, &name, &status).await?;
    }

    if status.state.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(30)))
    }
}

pub fn error_policy(obj: Arc<ComponentBuild>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();

    if let Some(ref health_state) = ctx.health_state {
        health_state
            .metrics
            .record_error("componentbuild", &obj.namespace().unwrap_or_default());
    }

    if error.is_not_found() {
        debug!(name = %name, "Component build not found (likely deleted)");
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

/// Compute the next status from the observed status and the backing job.
///
/// Start and completion timestamps are written exactly once: whatever the
/// observed status already records wins.
pub fn next_status(
    observed: &ComponentBuildStatus,
    job: &BatchJob,
) -> Result<ComponentBuildStatus, Error> {
    let job_status = job.status.clone().unwrap_or_default();
    let active = job_status.active.unwrap_or(0);
    let succeeded = job_status.succeeded.unwrap_or(0);
    let failed = job_status.failed.unwrap_or(0);

    let mut status = observed.clone();

    if succeeded > 0 {
        let fqn = job
            .annotations()
            .get(DOCKER_IMAGE_FQN_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                Error::Contract(format!(
                    "succeeded build job {} is missing the {} annotation",
                    job.name_any(),
                    DOCKER_IMAGE_FQN_ANNOTATION
                ))
            })?;

        status.state = ComponentBuildState::Succeeded;
        status.artifacts = Some(ComponentBuildArtifacts {
            docker_image_fqn: fqn,
        });
        status.failure_info = None;
    } else if failed > 0 && active == 0 {
        status.state = ComponentBuildState::Failed;
        status.failure_info = Some(job_failure_info(job));
    } else if active > 0 {
        status.state = ComponentBuildState::Running;
    } else {
        status.state = ComponentBuildState::Queued;
    }

    if status.start_timestamp.is_none()
        && (status.state == ComponentBuildState::Running || status.state.is_terminal())
    {
        status.start_timestamp = Some(Utc::now());
    }
    if status.completion_timestamp.is_none() && status.state.is_terminal() {
        status.completion_timestamp = Some(Utc::now());
    }

    Ok(status)
}

/// Failure info published by the build executor, falling back to a generic
/// internal failure when the executor did not (or could not) report one.
fn job_failure_info(job: &BatchJob) -> FailureInfo {
    match job.annotations().get(BUILD_FAILURE_INFO_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw)
            .unwrap_or_else(|_| FailureInfo::internal("build failed with malformed failure info")),
        None => FailureInfo::internal("build job failed"),
    }
}

/// The batch job backing a component build.
fn build_job(build: &ComponentBuild, config: &ComponentBuilderConfig) -> Result<BatchJob, Error> {
    let name = build.name_any();
    let definition = serde_json::to_string(&build.spec.definition)?;

    let mut env = vec![EnvVar {
        name: "COMPONENT_BUILD_DEFINITION".to_string(),
        value: Some(definition),
        ..Default::default()
    }];
    if let Some(registry) = &config.docker_registry {
        env.push(EnvVar {
            name: "DOCKER_REGISTRY".to_string(),
            value: Some(registry.clone()),
            ..Default::default()
        });
    }

    let labels = [(JOB_COMPONENT_BUILD_LABEL.to_string(), name.clone())]
        .into_iter()
        .collect();

    Ok(BatchJob {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: build.namespace(),
            labels: Some(labels),
            owner_references: build.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "build".to_string(),
                        image: Some(config.image.clone()),
                        env: Some(env),
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
