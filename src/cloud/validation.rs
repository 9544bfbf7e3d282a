use std::net::IpAddr;

use crate::resources::clusters::{
    AwsCloudSpec, AzureCloudSpec, CloudProvider, CloudSpec, ClusterNetwork, ClusterSpec,
    DigitaloceanCloudSpec, GcpCloudSpec, HetznerCloudSpec, OpenstackCloudSpec, SecretReference,
};
use crate::resources::datacenters::{Datacenter, DatacenterSpec};
use crate::{Error, Result};

use super::credentials::keys;

const AZURE_LOAD_BALANCER_SKUS: [&str; 3] = ["", "standard", "basic"];
const PROXY_MODES: [&str; 3] = ["ipvs", "iptables", "ebpf"];

/// Validate a cluster spec before it is converged
pub fn validate_cluster_spec(spec: &ClusterSpec, dc: &Datacenter) -> Result<()> {
    if spec.human_readable_name.is_empty() {
        return Err(Error::InvalidClusterSpec("no name specified".into()));
    }

    validate_cloud_spec(&spec.cloud, dc)?;

    if let Err(err) = semver::Version::parse(spec.version.trim_start_matches('v')) {
        return Err(Error::InvalidClusterSpec(format!(
            "invalid version {:?}: {err}",
            spec.version
        )));
    }

    validate_cluster_network(&spec.cluster_network)?;

    if let Some(range) = spec
        .components_override
        .as_ref()
        .and_then(|c| c.apiserver.as_ref())
        .and_then(|a| a.node_port_range.as_deref())
    {
        validate_node_port_range(range)?;
    }

    Ok(())
}

/// Validate the cloud part of a cluster spec against the datacenter it is placed in
pub fn validate_cloud_spec(spec: &CloudSpec, dc: &Datacenter) -> Result<()> {
    if spec.datacenter_name.is_empty() {
        return Err(invalid("no node datacenter specified"));
    }

    if spec.provider.name() != dc.spec.provider_name() {
        return Err(invalid(format!(
            "datacenter {:?} is not a {} datacenter",
            spec.datacenter_name,
            spec.provider.name()
        )));
    }

    match &spec.provider {
        CloudProvider::Fake(fake) => {
            if fake.token.is_empty() {
                return Err(invalid("no token specified"));
            }
            Ok(())
        }
        CloudProvider::Aws(aws) => validate_aws(aws),
        CloudProvider::Azure(azure) => validate_azure(azure),
        CloudProvider::Digitalocean(digitalocean) => validate_digitalocean(digitalocean),
        CloudProvider::Gcp(gcp) => validate_gcp(gcp),
        CloudProvider::Hetzner(hetzner) => validate_hetzner(hetzner),
        CloudProvider::Openstack(openstack) => validate_openstack(openstack, &dc.spec),
        CloudProvider::BringYourOwn(_) => Ok(()),
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidCloudSpec(message.into())
}

/// An inline value, or a complete reference to a secret that will hold it
fn require(
    inline: &Option<String>,
    reference: &Option<SecretReference>,
    key: &str,
) -> Result<()> {
    if inline.as_deref().is_some_and(|v| !v.is_empty()) {
        return Ok(());
    }
    match reference {
        None => Err(invalid(format!(
            "{key:?} is not set and no credentials reference is specified"
        ))),
        Some(r) if r.name.is_empty() => Err(invalid(format!(
            "{key:?} cannot be resolved: credentials reference has no name"
        ))),
        Some(r) if r.namespace.is_empty() => Err(invalid(format!(
            "{key:?} cannot be resolved: credentials reference has no namespace"
        ))),
        Some(_) => Ok(()),
    }
}

fn validate_allowed_ip_range(range: &Option<String>) -> Result<()> {
    match range.as_deref() {
        Some(range) if !range.is_empty() => parse_cidr(range)
            .map(|_| ())
            .map_err(|e| invalid(format!("invalid nodePortsAllowedIPRange: {e}"))),
        _ => Ok(()),
    }
}

fn validate_aws(spec: &AwsCloudSpec) -> Result<()> {
    require(&spec.access_key_id, &spec.credentials_reference, keys::AWS_ACCESS_KEY_ID)?;
    require(
        &spec.secret_access_key,
        &spec.credentials_reference,
        keys::AWS_SECRET_ACCESS_KEY,
    )?;
    validate_allowed_ip_range(&spec.node_ports_allowed_ip_range)
}

fn validate_azure(spec: &AzureCloudSpec) -> Result<()> {
    require(&spec.tenant_id, &spec.credentials_reference, keys::AZURE_TENANT_ID)?;
    require(
        &spec.subscription_id,
        &spec.credentials_reference,
        keys::AZURE_SUBSCRIPTION_ID,
    )?;
    require(&spec.client_id, &spec.credentials_reference, keys::AZURE_CLIENT_ID)?;
    require(
        &spec.client_secret,
        &spec.credentials_reference,
        keys::AZURE_CLIENT_SECRET,
    )?;

    let sku = spec.load_balancer_sku.as_deref().unwrap_or_default();
    if !AZURE_LOAD_BALANCER_SKUS.contains(&sku) {
        return Err(invalid(format!(
            "azure LB SKU cannot be {sku:?}, allowed values are {AZURE_LOAD_BALANCER_SKUS:?}"
        )));
    }
    Ok(())
}

fn validate_digitalocean(spec: &DigitaloceanCloudSpec) -> Result<()> {
    if spec.token.as_deref().unwrap_or_default().is_empty() && spec.credentials_reference.is_none()
    {
        return Err(invalid("no token or credentials reference specified"));
    }
    require(&spec.token, &spec.credentials_reference, keys::DIGITALOCEAN_TOKEN)
}

fn validate_gcp(spec: &GcpCloudSpec) -> Result<()> {
    require(
        &spec.service_account,
        &spec.credentials_reference,
        keys::GCP_SERVICE_ACCOUNT,
    )?;
    validate_allowed_ip_range(&spec.node_ports_allowed_ip_range)
}

fn validate_hetzner(spec: &HetznerCloudSpec) -> Result<()> {
    require(&spec.token, &spec.credentials_reference, keys::HETZNER_TOKEN)
}

fn validate_openstack(spec: &OpenstackCloudSpec, dc: &DatacenterSpec) -> Result<()> {
    let has_application_credential = spec
        .application_credential_id
        .as_deref()
        .is_some_and(|id| !id.is_empty());
    if has_application_credential {
        if spec
            .application_credential_secret
            .as_deref()
            .unwrap_or_default()
            .is_empty()
        {
            return Err(invalid("no applicationCredentialSecret specified"));
        }
    } else {
        require(&spec.domain, &spec.credentials_reference, keys::OPENSTACK_DOMAIN)?;
        require(&spec.username, &spec.credentials_reference, keys::OPENSTACK_USERNAME)?;
        require(&spec.password, &spec.credentials_reference, keys::OPENSTACK_PASSWORD)?;

        let has_project = [&spec.project, &spec.project_id]
            .iter()
            .any(|p| p.as_deref().is_some_and(|p| !p.is_empty()));
        if !has_project && spec.credentials_reference.is_none() {
            return Err(invalid("no tenant name or ID specified"));
        }
    }

    validate_allowed_ip_range(&spec.node_ports_allowed_ip_range)?;

    if let DatacenterSpec::Openstack {
        enforce_floating_ip: true,
        ..
    } = dc
    {
        if spec.floating_ip_pool.as_deref().unwrap_or_default().is_empty() {
            return Err(invalid("no floating ip pool specified"));
        }
    }

    Ok(())
}

fn validate_cluster_network(network: &ClusterNetwork) -> Result<()> {
    let mut errors = Vec::new();

    for (field, blocks) in [
        ("pods", &network.pods.cidr_blocks),
        ("services", &network.services.cidr_blocks),
    ] {
        match blocks.as_slice() {
            [] => {}
            [cidr] => {
                if let Err(e) = parse_cidr(cidr) {
                    errors.push(format!("{field}.cidrBlocks[0]: couldn't parse {cidr:?}: {e}"));
                }
            }
            _ => errors.push(format!(
                "{field}.cidrBlocks: must have at most 1 item, got {}",
                blocks.len()
            )),
        }
    }

    if let Some(domain) = network.dns_domain.as_deref().filter(|d| !d.is_empty()) {
        if domain != "cluster.local" {
            errors.push(format!("dnsDomain: must be 'cluster.local', got {domain:?}"));
        }
    }

    if let Some(mode) = network.proxy_mode.as_deref().filter(|m| !m.is_empty()) {
        if !PROXY_MODES.contains(&mode) {
            errors.push(format!(
                "proxyMode: unsupported value {mode:?}, supported values are {PROXY_MODES:?}"
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidClusterSpec(format!(
            "cluster network config validation failed: {}",
            errors.join(", ")
        )))
    }
}

/// A node port range is `base-max`, or a single port
fn validate_node_port_range(range: &str) -> Result<()> {
    let invalid_range = |reason: &str| {
        Error::InvalidClusterSpec(format!(
            "apiserver nodePortRange {range:?} is invalid: {reason}"
        ))
    };

    let (base, max) = match range.split_once('-') {
        Some((base, max)) => (base.trim(), max.trim()),
        None => (range.trim(), range.trim()),
    };
    let base: u16 = base.parse().map_err(|_| invalid_range("bad base port"))?;
    let max: u16 = max.parse().map_err(|_| invalid_range("bad max port"))?;

    if base == 0 {
        return Err(invalid_range("base port must not be 0"));
    }
    if max < base {
        return Err(invalid_range("max port is smaller than base port"));
    }
    Ok(())
}

fn parse_cidr(cidr: &str) -> std::result::Result<(IpAddr, u8), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| "missing prefix length".to_string())?;
    let addr: IpAddr = addr.parse().map_err(|e| format!("{e}"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("bad prefix length {prefix:?}"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("prefix length {prefix} exceeds {max}"));
    }
    Ok((addr, prefix))
}
