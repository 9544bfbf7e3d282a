pub mod clusters;
pub mod datacenters;
