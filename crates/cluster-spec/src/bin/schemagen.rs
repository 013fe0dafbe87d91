//! Print the JSON schema of the cluster document as YAML

use cluster_spec::Cluster;

fn main() {
    let schema = schemars::schema_for!(Cluster);
    match serde_yaml::to_string(&schema) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => {
            eprintln!("failed to render schema: {e}");
            std::process::exit(1);
        }
    }
}
