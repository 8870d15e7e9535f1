//! dnsmasq file rendering.

use kube::core::ObjectMeta;
use lattice_operator::crd::{Endpoint, EndpointSpec};
use lattice_operator::dns::{fqdn, render, RenderedDns};

fn endpoint(namespace: &str, path: &str, ip: Option<&str>, external: Option<&str>) -> Endpoint {
    Endpoint {
        metadata: ObjectMeta {
            name: Some("endpoint".to_string()),
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
fn host_line_is_exactly_ip_space_fqdn() {
    let rendered = render(&[endpoint("lattice-system-id", "/nodepath", Some("1"), None)]);
    assert_eq!(rendered.hosts, "1 nodepath.local.system-id.lattice.local\n");
    assert_eq!(rendered.config, "");
}

#[test]
fn cname_line_targets_the_external_name() {
    let rendered = render(&[endpoint(
        "lattice-petflix",
        "/www",
        None,
        Some("cdn.example.net"),
    )]);
    assert_eq!(
        rendered.config,
        "cname=www.local.petflix.lattice.local,cdn.example.net\n"
    );
    assert_eq!(rendered.hosts, "");
}

#[test]
fn nested_paths_reverse_into_domains() {
    assert_eq!(
        fqdn("/products/api/v2", "shop"),
        "v2.api.products.local.shop.lattice.local"
    );
}

#[test]
fn mixed_endpoints_split_across_both_files() {
    let rendered = render(&[
        endpoint("lattice-shop", "/api", Some("172.16.0.0"), None),
        endpoint("lattice-shop", "/www", None, Some("cdn.example.net")),
    ]);
    assert_eq!(rendered.hosts, "172.16.0.0 api.local.shop.lattice.local\n");
    assert_eq!(
        rendered.config,
        "cname=www.local.shop.lattice.local,cdn.example.net\n"
    );
}

#[test]
fn no_endpoints_render_empty_files() {
    assert_eq!(render(&[]), RenderedDns::default());
}

#[test]
fn endpoints_outside_system_namespaces_are_skipped() {
    let rendered = render(&[endpoint("kube-system", "/api", Some("10.0.0.1"), None)]);
    assert_eq!(rendered, RenderedDns::default());
}

#[test]
fn endpoints_in_the_operator_namespace_are_skipped() {
    // "lattice-internal" carries the system namespace prefix but is the
    // operator's own namespace, not the system "internal".
    let rendered = render(&[endpoint(
        lattice_operator::crd::INTERNAL_NAMESPACE,
        "/api",
        Some("10.0.0.1"),
        None,
    )]);
    assert_eq!(rendered, RenderedDns::default());
}
