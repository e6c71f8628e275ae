use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use kube::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    coordinator::{AttachOptions, AttachmentCoordinator},
    flex::{client_access_info, driver_info, global_mount_path, kernel_version},
    mount_dir::attach_info_from_mount_dir,
};
use crate::{client::executor::CommandExecutor, config::AgentConfig, Error, Result};

const SOCKET_MODE: u32 = 0o770;

#[derive(Deserialize, Debug)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Result(Value),
    Error(String),
}

/// Answers one decoded request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MountDirParams {
    mount_dir: String,
    #[serde(flatten)]
    opts: AttachOptions,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GlobalMountPathParams {
    volume_name: String,
    #[serde(default)]
    driver_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ClientAccessParams {
    cluster_namespace: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct LogParams {
    message: String,
    #[serde(default)]
    is_error: bool,
}

/// The flex driver's view of this node's agent.
pub struct AgentService {
    config: AgentConfig,
    client: Client,
    coordinator: AttachmentCoordinator,
    executor: Arc<dyn CommandExecutor>,
}

impl AgentService {
    pub fn new(
        config: AgentConfig,
        client: Client,
        coordinator: AttachmentCoordinator,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        AgentService {
            config,
            client,
            coordinator,
            executor,
        }
    }
}

#[async_trait]
impl Handler for AgentService {
    async fn handle(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            "Attach" => {
                let opts: AttachOptions = params(value)?;
                Ok(Value::String(self.coordinator.attach(&opts).await?))
            }
            "Detach" | "DetachForce" => {
                let opts: AttachOptions = params(value)?;
                self.coordinator.detach(&opts, method == "DetachForce").await?;
                Ok(Value::Null)
            }
            "RemoveAttachmentObject" => {
                let opts: AttachOptions = params(value)?;
                Ok(Value::Bool(self.coordinator.remove_attachment_object(&opts).await?))
            }
            "GetAttachInfoFromMountDir" => {
                let p: MountDirParams = params(value)?;
                let opts =
                    attach_info_from_mount_dir(self.client.clone(), &self.config.node_name, &p.mount_dir, p.opts)
                        .await?;
                Ok(serde_json::to_value(opts)?)
            }
            "GetGlobalMountPath" => {
                let p: GlobalMountPathParams = params(value)?;
                let (vendor, driver) = match p.driver_dir {
                    Some(dir) => driver_info(&dir)?,
                    None => (self.config.vendor.clone(), self.config.driver.clone()),
                };
                let path = global_mount_path(&self.config.kubelet_root, &vendor, &driver, &p.volume_name);
                Ok(Value::String(path.display().to_string()))
            }
            "GetClientAccessInfo" => {
                let p: ClientAccessParams = params(value)?;
                Ok(serde_json::to_value(
                    client_access_info(self.client.clone(), &p.cluster_namespace).await?,
                )?)
            }
            "GetKernelVersion" => Ok(Value::String(kernel_version(self.executor.as_ref()).await?)),
            "Log" => {
                let p: LogParams = params(value)?;
                if p.is_error {
                    error!(target: "flexdriver", "{}", p.message);
                } else {
                    info!(target: "flexdriver", "{}", p.message);
                }
                Ok(Value::Null)
            }
            other => Err(Error::InvalidSpec(format!("unknown method {other}"))),
        }
    }
}

/// Binds the socket, replacing a stale one, and opens it to the group.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let io = |what: &str, e: std::io::Error| Error::Fatal(format!("{what} {}: {e}", path.display()));
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io("creating", e))?;
    }
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| io("removing stale socket", e))?;
    }
    let listener = UnixListener::bind(path).map_err(|e| io("binding", e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .map_err(|e| io("setting permissions on", e))?;
    info!("listening on {}", path.display());
    Ok(listener)
}

/// Accepts connections until cancelled. Each connection carries newline
/// delimited requests answered in order.
pub async fn serve(listener: UnixListener, handler: Arc<dyn Handler>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        warn!("agent connection failed: {e}");
                    }
                });
            }
            Err(e) => error!("failed to accept agent connection: {e}"),
        }
    }
}

async fn serve_connection(stream: UnixStream, handler: Arc<dyn Handler>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!("agent request {}", request.method);
                match handler.handle(&request.method, request.params).await {
                    Ok(value) => Response::Result(value),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Err(e) => Response::Error(format!("malformed request: {e}")),
        };
        let mut out = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, method: &str, params: Value) -> Result<Value> {
            match method {
                "Echo" => Ok(params),
                other => Err(Error::InvalidSpec(format!("unknown method {other}"))),
            }
        }
    }

    async fn roundtrip(stream: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>) -> Response {
        let line = stream.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn requests_are_answered_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rook.io~rook").join(".rook.sock");
        let listener = bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);

        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::new(Echo), cancel.clone()));

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"{\"method\":\"Echo\",\"params\":{\"a\":1}}\n{\"method\":\"Nope\"}\nnot json\n")
            .await
            .unwrap();

        assert_eq!(roundtrip(&mut lines).await, Response::Result(json!({"a": 1})));
        match roundtrip(&mut lines).await {
            Response::Error(e) => assert!(e.contains("unknown method Nope")),
            other => panic!("unexpected {other:?}"),
        }
        match roundtrip(&mut lines).await {
            Response::Error(e) => assert!(e.starts_with("malformed request")),
            other => panic!("unexpected {other:?}"),
        }

        cancel.cancel();
        server.await.unwrap();
    }

    #[test]
    fn responses_are_tagged() {
        assert_eq!(
            serde_json::to_string(&Response::Result(json!("/dev/rbd0"))).unwrap(),
            r#"{"result":"/dev/rbd0"}"#
        );
        assert_eq!(
            serde_json::to_string(&Response::Error("busy".into())).unwrap(),
            r#"{"error":"busy"}"#
        );
    }

    #[test]
    fn mount_dir_params_carry_the_options() {
        let p: MountDirParams =
            serde_json::from_value(json!({"mountDir": "/var/lib/kubelet/pods/u/volumes/rook.io~rook/pv", "pool": "p"}))
                .unwrap();
        assert_eq!(p.opts.pool, "p");
        assert!(p.mount_dir.ends_with("/pv"));
    }
}
