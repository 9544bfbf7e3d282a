use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A datacenter clusters can be placed in
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    pub country: Option<String>,
    pub location: Option<String>,
    /// Written as a single-key map, `aws: {region: ...}`
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub spec: DatacenterSpec,
}

/// Provider specific datacenter settings. The variant must match the provider of clusters placed here.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum DatacenterSpec {
    Fake {},
    Aws {
        region: String,
    },
    Azure {
        location: String,
    },
    Digitalocean {
        region: String,
    },
    #[serde(rename_all = "camelCase")]
    Gcp {
        region: String,
        #[serde(default)]
        zone_suffixes: Vec<String>,
    },
    Hetzner {
        datacenter: Option<String>,
        location: Option<String>,
        network: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Openstack {
        auth_url: String,
        region: String,
        /// Clusters must configure a floating IP pool
        #[serde(default)]
        enforce_floating_ip: bool,
    },
    BringYourOwn {},
}

impl DatacenterSpec {
    pub fn provider_name(&self) -> &'static str {
        match self {
            DatacenterSpec::Fake {} => "fake",
            DatacenterSpec::Aws { .. } => "aws",
            DatacenterSpec::Azure { .. } => "azure",
            DatacenterSpec::Digitalocean { .. } => "digitalocean",
            DatacenterSpec::Gcp { .. } => "gcp",
            DatacenterSpec::Hetzner { .. } => "hetzner",
            DatacenterSpec::Openstack { .. } => "openstack",
            DatacenterSpec::BringYourOwn {} => "bringyourown",
        }
    }
}

/// All datacenters known to this operator instance, keyed by name
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DatacenterRegistry {
    #[serde(default)]
    datacenters: BTreeMap<String, Datacenter>,
}

impl DatacenterRegistry {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("invalid datacenters file: {e}")))
    }

    pub fn get(&self, name: &str) -> Result<&Datacenter> {
        self.datacenters
            .get(name)
            .ok_or_else(|| Error::DatacenterNotFound(name.into()))
    }

    pub fn len(&self) -> usize {
        self.datacenters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datacenters.is_empty()
    }
}

impl FromIterator<(String, Datacenter)> for DatacenterRegistry {
    fn from_iter<T: IntoIterator<Item = (String, Datacenter)>>(iter: T) -> Self {
        Self {
            datacenters: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATACENTERS: &str = r#"
datacenters:
  eu-west:
    country: DE
    location: Frankfurt
    spec:
      aws:
        region: eu-central-1
  byo:
    spec:
      bringYourOwn: {}
  os-1:
    spec:
      openstack:
        authUrl: https://keystone.example.com:5000/v3
        region: RegionOne
        enforceFloatingIp: true
"#;

    #[test]
    fn parses_registry() {
        let registry = DatacenterRegistry::from_yaml(DATACENTERS).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get("byo").unwrap().spec,
            DatacenterSpec::BringYourOwn {}
        );

        let dc = registry.get("eu-west").unwrap();
        assert_eq!(dc.country.as_deref(), Some("DE"));
        assert_eq!(
            dc.spec,
            DatacenterSpec::Aws {
                region: "eu-central-1".into()
            }
        );

        match &registry.get("os-1").unwrap().spec {
            DatacenterSpec::Openstack {
                enforce_floating_ip,
                ..
            } => assert!(enforce_floating_ip),
            other => panic!("unexpected datacenter {other:?}"),
        }
    }

    #[test]
    fn unknown_datacenter_is_an_error() {
        let registry = DatacenterRegistry::default();
        assert!(matches!(
            registry.get("nope"),
            Err(Error::DatacenterNotFound(name)) if name == "nope"
        ));
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(matches!(
            DatacenterRegistry::from_yaml("datacenters: [1, 2"),
            Err(Error::InvalidConfig(_))
        ));
    }
}
