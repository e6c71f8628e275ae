use kube::CustomResourceExt;
use rook_controllers::api::v1::{
    cluster::Cluster, filesystem::Filesystem, object_store::ObjectStore, pool::Pool,
    volume_attachment::VolumeAttachment,
};

fn main() -> anyhow::Result<()> {
    for crd in [
        Cluster::crd(),
        Pool::crd(),
        Filesystem::crd(),
        ObjectStore::crd(),
        VolumeAttachment::crd(),
    ] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
