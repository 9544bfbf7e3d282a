use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::resources::clusters::{CloudProvider, Cluster, SecretReference};
use crate::{Error, Result};

/// Secret keys holding provider credentials when a credentials reference is used
pub mod keys {
    pub const AWS_ACCESS_KEY_ID: &str = "accessKeyId";
    pub const AWS_SECRET_ACCESS_KEY: &str = "secretAccessKey";
    pub const AZURE_TENANT_ID: &str = "tenantID";
    pub const AZURE_SUBSCRIPTION_ID: &str = "subscriptionID";
    pub const AZURE_CLIENT_ID: &str = "clientID";
    pub const AZURE_CLIENT_SECRET: &str = "clientSecret";
    pub const DIGITALOCEAN_TOKEN: &str = "token";
    pub const GCP_SERVICE_ACCOUNT: &str = "serviceAccount";
    pub const HETZNER_TOKEN: &str = "token";
    pub const OPENSTACK_USERNAME: &str = "username";
    pub const OPENSTACK_PASSWORD: &str = "password";
    pub const OPENSTACK_PROJECT: &str = "project";
    pub const OPENSTACK_PROJECT_ID: &str = "projectID";
    pub const OPENSTACK_DOMAIN: &str = "domain";
    pub const OPENSTACK_APPLICATION_CREDENTIAL_ID: &str = "applicationCredentialID";
    pub const OPENSTACK_APPLICATION_CREDENTIAL_SECRET: &str = "applicationCredentialSecret";
}

/// Reads a single key out of a referenced secret
#[async_trait]
pub trait SecretLookup: Send + Sync {
    async fn secret_value(&self, reference: &SecretReference, key: &str) -> Result<String>;
}

/// Looks up secret values with a kube client
pub struct KubeSecretLookup {
    client: Client,
}

impl KubeSecretLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretLookup for KubeSecretLookup {
    async fn secret_value(&self, reference: &SecretReference, key: &str) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
        let secret = secrets
            .get_opt(&reference.name)
            .await?
            .ok_or_else(|| {
                Error::SecretNotFound(format!("{}/{}", reference.namespace, reference.name))
            })?;

        let missing = || {
            Error::SecretKeyNotFound(
                key.into(),
                format!("{}/{}", reference.namespace, reference.name),
            )
        };

        if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
            return String::from_utf8(value.0.clone()).map_err(|_| missing());
        }
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(key))
            .cloned()
            .ok_or_else(missing)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub assume_role_arn: String,
    pub assume_role_external_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub subscription_id: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenCredentials {
    pub token: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcpCredentials {
    pub service_account: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenstackCredentials {
    pub username: String,
    pub password: String,
    pub project: String,
    pub project_id: String,
    pub domain: String,
    pub application_credential_id: String,
    pub application_credential_secret: String,
}

/// Resolved credentials for the provider of a cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Fake(TokenCredentials),
    Aws(AwsCredentials),
    Azure(AzureCredentials),
    Digitalocean(TokenCredentials),
    Gcp(GcpCredentials),
    Hetzner(TokenCredentials),
    Openstack(OpenstackCredentials),
    BringYourOwn,
}

impl Credentials {
    pub fn provider_name(&self) -> &'static str {
        match self {
            Credentials::Fake(_) => "fake",
            Credentials::Aws(_) => "aws",
            Credentials::Azure(_) => "azure",
            Credentials::Digitalocean(_) => "digitalocean",
            Credentials::Gcp(_) => "gcp",
            Credentials::Hetzner(_) => "hetzner",
            Credentials::Openstack(_) => "openstack",
            Credentials::BringYourOwn => "bringyourown",
        }
    }
}

struct Resolver<'a> {
    reference: Option<&'a SecretReference>,
    secrets: &'a dyn SecretLookup,
}

impl Resolver<'_> {
    /// Inline values win; otherwise the key is read from the referenced secret
    async fn value(&self, inline: &Option<String>, key: &str) -> Result<String> {
        if let Some(value) = inline.as_deref().filter(|v| !v.is_empty()) {
            return Ok(value.into());
        }
        match self.reference {
            Some(reference) => self.secrets.secret_value(reference, key).await,
            None => Err(Error::InvalidCloudSpec(format!(
                "{key:?} is not set and no credentials reference is specified"
            ))),
        }
    }

    /// Like value, but a missing value resolves to an empty string
    async fn optional(&self, inline: &Option<String>, key: &str) -> Result<String> {
        match self.value(inline, key).await {
            Ok(value) => Ok(value),
            Err(Error::SecretKeyNotFound(_, _)) | Err(Error::InvalidCloudSpec(_)) => {
                Ok(String::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// Resolve the provider credentials of a cluster
pub async fn resolve_credentials(
    cluster: &Cluster,
    secrets: &dyn SecretLookup,
) -> Result<Credentials> {
    use keys::*;

    Ok(match &cluster.spec.cloud.provider {
        CloudProvider::Fake(spec) => Credentials::Fake(TokenCredentials {
            token: spec.token.clone(),
        }),
        CloudProvider::Aws(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            Credentials::Aws(AwsCredentials {
                access_key_id: r.value(&spec.access_key_id, AWS_ACCESS_KEY_ID).await?,
                secret_access_key: r
                    .value(&spec.secret_access_key, AWS_SECRET_ACCESS_KEY)
                    .await?,
                // assume role settings are optional and never read from the secret
                assume_role_arn: spec.assume_role_arn.clone().unwrap_or_default(),
                assume_role_external_id: spec.assume_role_external_id.clone().unwrap_or_default(),
            })
        }
        CloudProvider::Azure(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            Credentials::Azure(AzureCredentials {
                tenant_id: r.value(&spec.tenant_id, AZURE_TENANT_ID).await?,
                subscription_id: r.value(&spec.subscription_id, AZURE_SUBSCRIPTION_ID).await?,
                client_id: r.value(&spec.client_id, AZURE_CLIENT_ID).await?,
                client_secret: r.value(&spec.client_secret, AZURE_CLIENT_SECRET).await?,
            })
        }
        CloudProvider::Digitalocean(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            Credentials::Digitalocean(TokenCredentials {
                token: r.value(&spec.token, DIGITALOCEAN_TOKEN).await?,
            })
        }
        CloudProvider::Gcp(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            Credentials::Gcp(GcpCredentials {
                service_account: r.value(&spec.service_account, GCP_SERVICE_ACCOUNT).await?,
            })
        }
        CloudProvider::Hetzner(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            Credentials::Hetzner(TokenCredentials {
                token: r.value(&spec.token, HETZNER_TOKEN).await?,
            })
        }
        CloudProvider::Openstack(spec) => {
            let r = Resolver {
                reference: spec.credentials_reference.as_ref(),
                secrets,
            };
            let application_credential_id = r
                .optional(
                    &spec.application_credential_id,
                    OPENSTACK_APPLICATION_CREDENTIAL_ID,
                )
                .await?;

            if !application_credential_id.is_empty() {
                Credentials::Openstack(OpenstackCredentials {
                    application_credential_secret: r
                        .value(
                            &spec.application_credential_secret,
                            OPENSTACK_APPLICATION_CREDENTIAL_SECRET,
                        )
                        .await?,
                    application_credential_id,
                    ..Default::default()
                })
            } else {
                Credentials::Openstack(OpenstackCredentials {
                    domain: r.value(&spec.domain, OPENSTACK_DOMAIN).await?,
                    username: r.value(&spec.username, OPENSTACK_USERNAME).await?,
                    password: r.value(&spec.password, OPENSTACK_PASSWORD).await?,
                    project: r.optional(&spec.project, OPENSTACK_PROJECT).await?,
                    project_id: r.optional(&spec.project_id, OPENSTACK_PROJECT_ID).await?,
                    ..Default::default()
                })
            }
        }
        CloudProvider::BringYourOwn(_) => Credentials::BringYourOwn,
    })
}
