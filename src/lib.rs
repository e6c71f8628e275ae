pub mod error;
pub mod config;

pub use error::{Error, ErrorKind, Result};

pub mod api {
    pub mod constants;
    pub mod v1 {
        pub mod cluster;
        pub mod filesystem;
        pub mod object_store;
        pub mod pool;
        pub mod volume_attachment;
    }
}

pub mod telemetry {
    pub mod metrics;
    pub mod state;
    #[allow(clippy::module_inception)]
    pub mod telemetry;
}

pub mod client {
    pub mod ceph;
    pub mod executor;
    pub mod kv_store;
    pub mod watch;
}

pub mod mon {
    pub mod cluster_info;
    pub mod config;
    pub mod endpoints;
    pub mod health;
    pub mod manager;
    pub mod placement;
    pub mod workload;
}

pub mod osd {
    pub mod orchestrator;
    pub mod pod;
    pub mod safety;
    pub mod spec;
    pub mod status;
    pub mod workloads;
}

pub mod attachment {
    pub mod coordinator;
    pub mod flex;
    pub mod mount_dir;
    pub mod rpc;
    pub mod store;
}

pub mod disruption {
    pub mod controller;
    pub mod failure_domain;
    pub mod pdb;
    pub mod state;
}

pub mod cluster {
    pub mod controller;
}

pub mod pool {
    pub mod controller;
}

#[cfg(test)]
pub(crate) mod testing;
