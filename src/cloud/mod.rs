pub mod credentials;
mod validation;

pub use credentials::{resolve_credentials, Credentials, KubeSecretLookup, SecretLookup};
pub use validation::{validate_cloud_spec, validate_cluster_spec};
