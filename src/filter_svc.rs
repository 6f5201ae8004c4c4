//! Filter Service: the gRPC service implemented by the `csif-filter`
//! sidecar binary. Owns a single target daemon and, at most, one live
//! target backed by a small fake file — the real source device is
//! re-exported by the node's own target daemon instead (see
//! `orchestrator.rs`).

use std::sync::Mutex;

use tonic::{Code, Request, Response, Status};

use crate::{
    config,
    filter::{
        filter_server::Filter, CreateTargetReply, CreateTargetRequest,
        DeleteTargetReply, DeleteTargetRequest,
    },
    tgtd::{TargetDaemonDriver, Target},
};

struct State {
    driver: TargetDaemonDriver,
    live: Option<Target>,
}

pub struct FilterService {
    state: Mutex<State>,
    portal: String,
}

impl FilterService {
    pub fn new(portal: String, tgt_port: u16, tgt_control: &str) -> Self {
        let driver = TargetDaemonDriver::spawn(tgt_port, tgt_control)
            .expect("failed to start filter target daemon");
        FilterService {
            state: Mutex::new(State { driver, live: None }),
            portal,
        }
    }

    fn ensure_fake_bstore() -> std::io::Result<()> {
        let path = config::FILTER_FAKE_BSTORE_PATH;
        if std::path::Path::new(path).exists() {
            return Ok(());
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(config::FILTER_FAKE_BSTORE_SIZE)
    }
}

#[tonic::async_trait]
impl Filter for FilterService {
    async fn create_target(
        &self,
        _request: Request<CreateTargetRequest>,
    ) -> Result<Response<CreateTargetReply>, Status> {
        let mut state = self.state.lock().expect("not poisoned");

        if state.live.is_some() {
            return Err(Status::new(
                Code::AlreadyExists,
                "a target is already live in this filter pod",
            ));
        }

        Self::ensure_fake_bstore()
            .map_err(|e| Status::internal(format!("failed to allocate fake backing store: {}", e)))?;

        let target = state
            .driver
            .create_disk(config::IQN_PREFIX_FILTER, config::FILTER_FAKE_BSTORE_PATH)
            .map_err(|e| Status::internal(e.to_string()))?;

        let reply = CreateTargetReply {
            portal: self.portal.clone(),
            port: state.driver.port() as u32,
            iqn: target.iqn.clone(),
        };
        state.live = Some(target);

        Ok(Response::new(reply))
    }

    async fn delete_target(
        &self,
        _request: Request<DeleteTargetRequest>,
    ) -> Result<Response<DeleteTargetReply>, Status> {
        let mut state = self.state.lock().expect("not poisoned");

        let target = state
            .live
            .take()
            .ok_or_else(|| Status::new(Code::NotFound, "no target is live in this filter pod"))?;

        if let Err(e) = state.driver.delete_disk(&target) {
            return Err(Status::internal(e.to_string()));
        }

        if let Err(e) = std::fs::remove_file(config::FILTER_FAKE_BSTORE_PATH) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove fake backing store: {}", e);
            }
        }

        Ok(Response::new(DeleteTargetReply {}))
    }
}
