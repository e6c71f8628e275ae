#[cfg(test)]
pub mod tests {
    use std::time::Duration;

    use ctor::ctor;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::{
        api::PostParams,
        config::{KubeConfigOptions, Kubeconfig},
        runtime::{conditions, wait::await_condition},
        Api, Client, Config, CustomResourceExt,
    };
    use rook_controllers::api::v1::{
        cluster::Cluster, filesystem::Filesystem, object_store::ObjectStore, pool::Pool,
        volume_attachment::VolumeAttachment,
    };
    use rstest::fixture;
    use rustls::crypto::CryptoProvider;
    use tempfile::TempDir;
    use testcontainers_modules::{
        k3s::{K3s, KUBE_SECURE_PORT},
        testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt},
    };

    /// A throwaway k3s server with the rook CRDs installed.
    pub struct K8s {
        client: Client,
        _container: ContainerAsync<K3s>,
        _conf_dir: TempDir,
    }

    impl K8s {
        pub async fn new() -> K8s {
            let conf_dir = tempfile::tempdir().expect("Unable to create kubeconfig dir");
            let container = K3s::default()
                .with_conf_mount(conf_dir.path())
                .with_privileged(true)
                .with_userns_mode("host")
                .start()
                .await
                .expect("Failed to start k3s");
            let client = get_kube_client(&container).await.expect("Unable to create client");
            install_crds(client.clone()).await;
            K8s {
                client,
                _container: container,
                _conf_dir: conf_dir,
            }
        }

        pub fn get_client(&self) -> Client {
            self.client.clone()
        }
    }

    #[fixture]
    pub async fn k8s_inst() -> K8s {
        K8s::new().await
    }

    #[ctor]
    fn on_startup() {
        if CryptoProvider::get_default().is_none() {
            rustls::crypto::ring::default_provider()
                .install_default()
                .expect("Error initializing rustls provider");
        }
    }

    async fn install_crds(client: Client) {
        let crds: Api<CustomResourceDefinition> = Api::all(client);
        for crd in [
            Cluster::crd(),
            Pool::crd(),
            Filesystem::crd(),
            ObjectStore::crd(),
            VolumeAttachment::crd(),
        ] {
            let name = crd.metadata.name.clone().expect("crd without a name");
            crds.create(&PostParams::default(), &crd)
                .await
                .expect("Unable to create crd");
            let established = await_condition(crds.clone(), &name, conditions::is_crd_established());
            tokio::time::timeout(Duration::from_secs(30), established)
                .await
                .expect("crd was not established in time")
                .expect("crd watch failed");
        }
    }

    // taken from testcontainers-k3s
    //  module test https://docs.rs/crate/testcontainers-modules/latest/source/src/k3s/mod.rs#235
    pub async fn get_kube_client(
        container: &ContainerAsync<K3s>,
    ) -> Result<kube::Client, Box<dyn std::error::Error + 'static>> {
        let conf_yaml = container.image().read_kube_config()?;

        let mut config = Kubeconfig::from_yaml(&conf_yaml).expect("Error loading kube config");

        let port = container.get_host_port_ipv4(KUBE_SECURE_PORT).await?;
        config.clusters.iter_mut().for_each(|cluster| {
            if let Some(server) = cluster.cluster.as_mut().and_then(|c| c.server.as_mut()) {
                *server = format!("https://127.0.0.1:{port}")
            }
        });

        let client_config =
            Config::from_custom_kubeconfig(config, &KubeConfigOptions::default()).await?;

        Ok(kube::Client::try_from(client_config)?)
    }
}
