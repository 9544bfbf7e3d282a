use kube::CustomResourceExt;
fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&fleet_operator::resources::clusters::Cluster::crd()).unwrap()
    )
}
