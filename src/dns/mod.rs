//! The dnsmasq flush loop backing the local cloud provider.
//!
//! Endpoints are rendered into two files dnsmasq watches: a hosts file for
//! IP endpoints and an extra-config file of `cname=` lines for external-name
//! endpoints. Each tick the loop re-renders from the live Endpoint list and
//! diffs against what it last wrote; the files are only rewritten when the
//! rendered output changed. Writes go through a sibling temp file and a
//! rename so dnsmasq never observes a half-written file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::config_store::ConfigStore;
use crate::controller::error::Error;
use crate::controller::patch_status;
use crate::crd::{system_for_namespace, Endpoint, EndpointState, EndpointStatus};

/// Domain suffix for all lattice-served names.
pub const CLUSTER_DOMAIN: &str = "lattice.local";

/// Where the flusher writes its output.
#[derive(Clone, Debug)]
pub struct DnsPaths {
    /// dnsmasq extra-config file (`cname=` lines).
    pub config_path: PathBuf,
    /// dnsmasq hosts file (`ip fqdn` lines).
    pub hosts_path: PathBuf,
}

impl Default for DnsPaths {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/var/run/lattice/dnsmasq.conf"),
            hosts_path: PathBuf::from("/var/run/lattice/hosts"),
        }
    }
}

pub struct DnsFlusher {
    client: Client,
    config: ConfigStore,
    writer: DnsWriter,
}

impl DnsFlusher {
    pub fn new(client: Client, config: ConfigStore, paths: DnsPaths) -> Self {
        Self {
            client,
            config,
            writer: DnsWriter::new(paths),
        }
    }

    /// Run the flush loop until the process shuts down.
    pub async fn run(self) {
        let config = self.config.initial_config().await;
        let interval = Duration::from_secs(config.dns_flush_interval_secs.max(1));
        info!(interval_secs = interval.as_secs(), "Starting DNS flush loop");

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush().await {
                warn!(error = %e, "DNS flush failed");
            }
        }
    }

    async fn flush(&self) -> Result<(), Error> {
        let api: Api<Endpoint> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        // Only endpoints inside system namespaces are served.
        let mut endpoints: Vec<Endpoint> = list
            .items
            .into_iter()
            .filter(|e| {
                e.namespace()
                    .as_deref()
                    .and_then(system_for_namespace)
                    .is_some()
            })
            .collect();
        endpoints.sort_by_key(|e| (e.namespace(), e.name_any()));

        let rendered = render(&endpoints);
        if self.writer.sync(&rendered).await? {
            debug!(endpoints = endpoints.len(), "Flushed DNS files");
        }

        // Everything on disk is served; flip pending endpoints over. In
        // steady state nothing here is Pending and the loop patches
        // nothing.
        for endpoint in &endpoints {
            let state = endpoint
                .status
                .as_ref()
                .map(|s| s.state)
                .unwrap_or_default();
            if state == EndpointState::Created {
                continue;
            }
            let namespace = endpoint.namespace().unwrap_or_default();
            let scoped: Api<Endpoint> = Api::namespaced(self.client.clone(), &namespace);
            patch_status(
                &scoped,
                &endpoint.name_any(),
                &EndpointStatus {
                    state: EndpointState::Created,
                },
            )
            .await?;
        }

        Ok(())
    }
}

/// Rendered dnsmasq inputs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedDns {
    pub hosts: String,
    pub config: String,
}

/// Writes rendered output to the dnsmasq files, remembering what it last
/// wrote so unchanged output touches nothing.
pub struct DnsWriter {
    paths: DnsPaths,
    last_written: Mutex<Option<RenderedDns>>,
}

impl DnsWriter {
    pub fn new(paths: DnsPaths) -> Self {
        Self {
            paths,
            last_written: Mutex::new(None),
        }
    }

    /// Bring both files up to date with `rendered`. Returns whether
    /// anything was written; identical output is a no-op.
    pub async fn sync(&self, rendered: &RenderedDns) -> Result<bool, Error> {
        {
            let last_written = self.last_written.lock().unwrap_or_else(|e| e.into_inner());
            if last_written.as_ref() == Some(rendered) {
                return Ok(false);
            }
        }

        write_atomically(&self.paths.hosts_path, &rendered.hosts).await?;
        write_atomically(&self.paths.config_path, &rendered.config).await?;

        let mut last_written = self.last_written.lock().unwrap_or_else(|e| e.into_inner());
        *last_written = Some(rendered.clone());
        Ok(true)
    }
}

/// Render endpoints into dnsmasq file contents. Endpoints outside system
/// namespaces must already be filtered out; endpoints with neither an IP
/// nor an external name are skipped.
pub fn render(endpoints: &[Endpoint]) -> RenderedDns {
    let mut rendered = RenderedDns::default();

    for endpoint in endpoints {
        let Some(system) = endpoint
            .namespace()
            .as_deref()
            .and_then(system_for_namespace)
            .map(str::to_string)
        else {
            continue;
        };
        let name = fqdn(&endpoint.spec.path, &system);

        if let Some(ip) = &endpoint.spec.ip {
            rendered.hosts.push_str(&format!("{ip} {name}\n"));
        } else if let Some(target) = &endpoint.spec.external_name {
            rendered.config.push_str(&format!("cname={name},{target}\n"));
        }
    }

    rendered
}

/// The served name for a path within a system: the path's segments reversed
/// and dot-joined, under `local.<system>.lattice.local`.
pub fn fqdn(path: &str, system: &str) -> String {
    let domain: Vec<&str> = path.trim_matches('/').split('/').rev().collect();
    format!("{}.local.{}.{}", domain.join("."), system, CLUSTER_DOMAIN)
}

async fn write_atomically(path: &Path, contents: &str) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".next");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::EndpointSpec;
    use kube::core::ObjectMeta;

    fn endpoint(namespace: &str, path: &str, ip: Option<&str>, external: Option<&str>) -> Endpoint {
        Endpoint {
            metadata: ObjectMeta {
                name: Some("e".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: EndpointSpec {
                ip: ip.map(str::to_string),
                external_name: external.map(str::to_string),
                path: path.to_string(),
            },
            status: None,
        }
    }

    #[test]
    fn ip_endpoint_renders_a_hosts_line() {
        let rendered = render(&[endpoint("lattice-system-id", "/nodepath", Some("1"), None)]);
        assert_eq!(rendered.hosts, "1 nodepath.local.system-id.lattice.local\n");
        assert_eq!(rendered.config, "");
    }

    #[test]
    fn external_name_endpoint_renders_a_cname_line() {
        let rendered = render(&[endpoint(
            "lattice-petflix",
            "/products/api",
            None,
            Some("api.example.com"),
        )]);
        assert_eq!(rendered.hosts, "");
        assert_eq!(
            rendered.config,
            "cname=api.products.local.petflix.lattice.local,api.example.com\n"
        );
    }

    #[test]
    fn no_endpoints_render_empty_files() {
        assert_eq!(render(&[]), RenderedDns::default());
    }

    #[test]
    fn fqdn_reverses_path_segments() {
        assert_eq!(
            fqdn("/a/b/c", "sys"),
            "c.b.a.local.sys.lattice.local"
        );
    }

    #[tokio::test]
    async fn writes_land_atomically_at_the_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        write_atomically(&path, "1 a.local.s.lattice.local\n")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "1 a.local.s.lattice.local\n"
        );

        // Rewrites replace the file in place.
        write_atomically(&path, "").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn unchanged_output_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DnsPaths {
            config_path: dir.path().join("dnsmasq.conf"),
            hosts_path: dir.path().join("hosts"),
        };
        let writer = DnsWriter::new(paths.clone());

        let rendered = render(&[endpoint("lattice-system-id", "/nodepath", Some("1"), None)]);
        assert!(writer.sync(&rendered).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&paths.hosts_path).unwrap(),
            "1 nodepath.local.system-id.lattice.local\n"
        );

        // Same rendered output again: nothing is touched. Removing the
        // file first proves no write happens, not just an equal one.
        std::fs::remove_file(&paths.hosts_path).unwrap();
        std::fs::remove_file(&paths.config_path).unwrap();
        assert!(!writer.sync(&rendered).await.unwrap());
        assert!(!paths.hosts_path.exists());
        assert!(!paths.config_path.exists());

        // A real change writes again.
        assert!(writer.sync(&RenderedDns::default()).await.unwrap());
        assert_eq!(std::fs::read_to_string(&paths.hosts_path).unwrap(), "");
    }
}
