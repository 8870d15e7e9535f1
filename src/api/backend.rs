//! Write path for user intents.
//!
//! Builds, deploys, and teardowns are append-only records: the backend only
//! ever creates new resources with generated names and never mutates or
//! re-runs an existing one. Everything after the create is the controllers'
//! business.

use kube::{Api, Client, ResourceExt};
use tracing::info;

use crate::controller::error::{Error, Result};
use crate::crd::{
    generated_name, system_namespace, Build, BuildSpec, Deploy, DeploySpec, System,
    SystemDefinition, Teardown, TeardownSpec,
};
use kube::core::ObjectMeta;

/// The user-facing write API.
#[derive(Clone)]
pub struct Backend {
    client: Client,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Start building a definition for a system. Returns the created
    /// build's name.
    pub async fn build(
        &self,
        system: &str,
        definition: SystemDefinition,
        version: Option<String>,
    ) -> Result<String> {
        let namespace = self.system_namespace(system).await?;
        let builds: Api<Build> = Api::namespaced(self.client.clone(), &namespace);

        let build = Build {
            metadata: ObjectMeta {
                name: Some(generated_name()),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec: BuildSpec {
                definition,
                version,
            },
            status: None,
        };

        let created = builds.create(&Default::default(), &build).await?;
        info!(system = %system, build = %created.name_any(), "Created build");
        Ok(created.name_any())
    }

    /// Deploy an existing build onto its system. Returns the created
    /// deploy's name.
    pub async fn deploy_build(&self, system: &str, build: &str) -> Result<String> {
        self.deploy(
            system,
            DeploySpec {
                build: Some(build.to_string()),
                version: None,
            },
        )
        .await
    }

    /// Deploy a version onto a system; the deploy controller resolves the
    /// version to a build.
    pub async fn deploy_version(&self, system: &str, version: &str) -> Result<String> {
        self.deploy(
            system,
            DeploySpec {
                build: None,
                version: Some(version.to_string()),
            },
        )
        .await
    }

    /// Tear a system's workloads down. Returns the created teardown's name.
    pub async fn teardown(&self, system: &str) -> Result<String> {
        let namespace = self.system_namespace(system).await?;
        let teardowns: Api<Teardown> = Api::namespaced(self.client.clone(), &namespace);

        let teardown = Teardown {
            metadata: ObjectMeta {
                name: Some(generated_name()),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec: TeardownSpec::default(),
            status: None,
        };

        let created = teardowns.create(&Default::default(), &teardown).await?;
        info!(system = %system, teardown = %created.name_any(), "Created teardown");
        Ok(created.name_any())
    }

    async fn deploy(&self, system: &str, spec: DeploySpec) -> Result<String> {
        let namespace = self.system_namespace(system).await?;
        let deploys: Api<Deploy> = Api::namespaced(self.client.clone(), &namespace);

        let deploy = Deploy {
            metadata: ObjectMeta {
                name: Some(generated_name()),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec,
            status: None,
        };

        let created = deploys.create(&Default::default(), &deploy).await?;
        info!(system = %system, deploy = %created.name_any(), "Created deploy");
        Ok(created.name_any())
    }

    /// Resolve and validate the system's namespace. Intents against a
    /// nonexistent system are rejected up front rather than left to wedge
    /// in the controllers.
    async fn system_namespace(&self, system: &str) -> Result<String> {
        let systems: Api<System> = Api::all(self.client.clone());
        match systems.get(system).await {
            Ok(_) => Ok(system_namespace(system)),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::Validation(format!(
                "system {system} does not exist"
            ))),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
