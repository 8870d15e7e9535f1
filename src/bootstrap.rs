//! Cluster bootstrap: everything the operator needs installed before the
//! controllers can run.
//!
//! Installation is create-and-tolerate-409 throughout, so bootstrapping an
//! already bootstrapped cluster is a no-op and a crashed bootstrap can
//! simply be re-run.

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::ObjectMeta;
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{
    Build, ComponentBuild, Config, ConfigSpec, Deploy, Endpoint, Job, JobRun, LoadBalancer,
    NodePool, Service, ServiceAddress, ServiceBuild, System, Teardown, CONFIG_NAME,
    INTERNAL_NAMESPACE,
};

const SERVICE_ACCOUNT: &str = "lattice-operator";
const CLUSTER_ROLE: &str = "lattice-operator";

/// The set of cluster resources the operator depends on.
pub struct Resources {
    pub namespace: Namespace,
    pub crds: Vec<CustomResourceDefinition>,
    pub service_account: ServiceAccount,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub config: Config,
}

impl Resources {
    /// Assemble the bootstrap set for the given initial config.
    pub fn new(config_spec: ConfigSpec) -> Self {
        Self {
            namespace: Namespace {
                metadata: ObjectMeta {
                    name: Some(INTERNAL_NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            crds: vec![
                System::crd(),
                Service::crd(),
                NodePool::crd(),
                Build::crd(),
                ServiceBuild::crd(),
                ComponentBuild::crd(),
                Deploy::crd(),
                Teardown::crd(),
                Job::crd(),
                JobRun::crd(),
                ServiceAddress::crd(),
                Endpoint::crd(),
                LoadBalancer::crd(),
                Config::crd(),
            ],
            service_account: ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(SERVICE_ACCOUNT.to_string()),
                    namespace: Some(INTERNAL_NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            cluster_role: ClusterRole {
                metadata: ObjectMeta {
                    name: Some(CLUSTER_ROLE.to_string()),
                    ..Default::default()
                },
                rules: Some(vec![
                    PolicyRule {
                        api_groups: Some(vec!["lattice.dev".to_string()]),
                        resources: Some(vec!["*".to_string()]),
                        verbs: vec!["*".to_string()],
                        ..Default::default()
                    },
                    PolicyRule {
                        api_groups: Some(vec!["".to_string()]),
                        resources: Some(vec![
                            "namespaces".to_string(),
                            "events".to_string(),
                        ]),
                        verbs: vec!["*".to_string()],
                        ..Default::default()
                    },
                    PolicyRule {
                        api_groups: Some(vec!["apps".to_string()]),
                        resources: Some(vec!["deployments".to_string()]),
                        verbs: vec!["*".to_string()],
                        ..Default::default()
                    },
                    PolicyRule {
                        api_groups: Some(vec!["batch".to_string()]),
                        resources: Some(vec!["jobs".to_string()]),
                        verbs: vec!["*".to_string()],
                        ..Default::default()
                    },
                    PolicyRule {
                        api_groups: Some(vec!["coordination.k8s.io".to_string()]),
                        resources: Some(vec!["leases".to_string()]),
                        verbs: vec!["*".to_string()],
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            },
            cluster_role_binding: ClusterRoleBinding {
                metadata: ObjectMeta {
                    name: Some(CLUSTER_ROLE.to_string()),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: CLUSTER_ROLE.to_string(),
                },
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: SERVICE_ACCOUNT.to_string(),
                    namespace: Some(INTERNAL_NAMESPACE.to_string()),
                    ..Default::default()
                }]),
            },
            config: Config {
                metadata: ObjectMeta {
                    name: Some(CONFIG_NAME.to_string()),
                    namespace: Some(INTERNAL_NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: config_spec,
            },
        }
    }

    /// Install everything. Idempotent: already-existing resources are left
    /// as they are.
    pub async fn install(&self, client: &Client) -> Result<()> {
        info!("Bootstrapping cluster resources");

        let namespaces: Api<Namespace> = Api::all(client.clone());
        create_if_absent(&namespaces, &self.namespace).await?;

        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        for crd in &self.crds {
            create_if_absent(&crds, crd).await?;
        }

        let service_accounts: Api<ServiceAccount> =
            Api::namespaced(client.clone(), INTERNAL_NAMESPACE);
        create_if_absent(&service_accounts, &self.service_account).await?;

        let cluster_roles: Api<ClusterRole> = Api::all(client.clone());
        create_if_absent(&cluster_roles, &self.cluster_role).await?;

        let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
        create_if_absent(&bindings, &self.cluster_role_binding).await?;

        let configs: Api<Config> = Api::namespaced(client.clone(), INTERNAL_NAMESPACE);
        create_if_absent(&configs, &self.config).await?;

        info!("Bootstrap complete");
        Ok(())
    }
}

async fn create_if_absent<K>(api: &Api<K>, resource: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    match api.create(&Default::default(), resource).await {
        Ok(_) => {
            info!(kind = %K::kind(&()), name = %resource.name_any(), "Created");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(kind = %K::kind(&()), name = %resource.name_any(), "Already exists");
            Ok(())
        }
        Err(e) => Err(Error::Kube(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CloudProviderConfig, LocalCloudProviderConfig, ServiceMeshConfig};

    fn config_spec() -> ConfigSpec {
        ConfigSpec {
            cloud_provider: CloudProviderConfig::Local(LocalCloudProviderConfig::default()),
            service_mesh: ServiceMeshConfig::Envoy(Default::default()),
            dns_flush_interval_secs: 5,
            component_builder: Default::default(),
        }
    }

    #[test]
    fn bootstrap_set_covers_every_crd() {
        let resources = Resources::new(config_spec());
        assert_eq!(resources.crds.len(), 14);

        let names: Vec<String> = resources.crds.iter().map(|c| c.name_any()).collect();
        assert!(names.contains(&"systems.lattice.dev".to_string()));
        assert!(names.contains(&"configs.lattice.dev".to_string()));
    }

    #[test]
    fn config_lands_in_the_internal_namespace() {
        let resources = Resources::new(config_spec());
        assert_eq!(
            resources.config.metadata.namespace.as_deref(),
            Some(INTERNAL_NAMESPACE)
        );
        assert_eq!(resources.config.metadata.name.as_deref(), Some(CONFIG_NAME));
    }
}
