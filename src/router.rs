// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Routes client requests to live backends by unit identifier.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{
    backend::Backend,
    config::Config,
    frame::{Exception, Pdu, UnitId},
};

/// The unit-id-indexed dispatcher.
///
/// Backends are instantiated lazily on the first request that names them and
/// live until the next [`Router::reload`].
pub struct Router {
    cfg: Arc<Config>,
    backends: RwLock<HashMap<String, Arc<Backend>>>,
}

impl Router {
    #[must_use]
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            cfg,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Forward `req` to the backend mapped to `unit_id`.
    ///
    /// The returned PDU always addresses the client's unit id. Routing and
    /// transport failures come back as gateway exception responses, never as
    /// a missing reply.
    pub async fn request_backend(&self, unit_id: UnitId, mut req: Pdu) -> Pdu {
        let function = req.function;
        let Some((backend, target_unit_id)) = self.backend_by_unit_id(unit_id).await else {
            // No backend target.
            return Pdu::exception(unit_id, function, Exception::GatewayTargetDevice);
        };
        // Transform to the target unit id for the backend leg.
        req.unit_id = target_unit_id;
        match backend.execute_request(req).await {
            Ok(mut rsp) => {
                // Restore the unit id to the client's original.
                rsp.unit_id = unit_id;
                rsp
            }
            Err(err) => {
                log::warn!("Request to backend {} failed: {err}", backend.name());
                Pdu::exception(unit_id, function, err.exception())
            }
        }
    }

    async fn backend_by_unit_id(&self, unit_id: UnitId) -> Option<(Arc<Backend>, UnitId)> {
        let (mapping, _) = self.cfg.unit_mapping(unit_id)?;
        let backend = self.backend(&mapping.backend).await?;
        Some((backend, mapping.target_unit_id))
    }

    async fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        if let Some(backend) = self.backends.read().await.get(name) {
            return Some(Arc::clone(backend));
        }
        self.create_backend(name).await
    }

    async fn create_backend(&self, name: &str) -> Option<Arc<Backend>> {
        let bcfg = self.cfg.backend_by_name(name)?;
        let mut backends = self.backends.write().await;
        // Another task may have created the backend while this one was
        // waiting for the writer lock.
        if let Some(backend) = backends.get(name) {
            return Some(Arc::clone(backend));
        }
        let backend = Arc::new(Backend::new(bcfg));
        backend.start().await;
        backends.insert(name.to_owned(), Arc::clone(&backend));
        Some(backend)
    }

    /// Stop every live backend and clear the map.
    ///
    /// Backends are re-created lazily from the current configuration on the
    /// next request that names them. In-flight requests race the shutdown
    /// and may observe `ClientClosed`, which surfaces to their clients as a
    /// gateway exception.
    pub async fn reload(&self) {
        let mut backends = self.backends.write().await;
        for backend in backends.values() {
            backend.stop().await;
        }
        backends.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::NamedTempFile;

    use crate::bytes::Bytes;

    use super::*;

    fn load_config(contents: &str) -> Arc<Config> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Config::load(file.path()).unwrap()
    }

    #[tokio::test]
    async fn unmapped_unit_id_yields_gateway_exception() {
        let config = load_config("backends: []\nunit_map: []\n");
        let router = Router::new(config);

        let req = Pdu {
            unit_id: 0x63,
            function: 0x03,
            payload: Bytes::from_static(&[0x00, 0x00, 0x00, 0x01]),
        };
        let rsp = router.request_backend(0x63, req).await;
        assert_eq!(rsp.unit_id, 0x63);
        assert_eq!(rsp.function, 0x83);
        assert_eq!(&rsp.payload[..], &[0x0B]);
    }

    #[tokio::test]
    async fn dead_backend_yields_target_failed() {
        // Reserve an ephemeral port, then free it so connects are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = load_config(&format!(
            r"
backends:
  - name: dead
    protocol: tcp
    address: {addr}
unit_map:
  - unit_id: 5
    backend: dead
    target_unit_id: 5
"
        ));
        let router = Router::new(config);

        let req = Pdu {
            unit_id: 5,
            function: 0x04,
            payload: Bytes::from_static(&[0x00, 0x10, 0x00, 0x02]),
        };
        let rsp = router.request_backend(5, req).await;
        assert_eq!(rsp.unit_id, 5);
        assert_eq!(rsp.function, 0x84);
        assert_eq!(&rsp.payload[..], &[0x0B]);
    }

    #[tokio::test]
    async fn reload_drops_live_backends() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = load_config(&format!(
            r"
backends:
  - name: dead
    protocol: tcp
    address: {addr}
unit_map:
  - unit_id: 5
    backend: dead
    target_unit_id: 5
"
        ));
        let router = Router::new(config);

        let req = Pdu {
            unit_id: 5,
            function: 0x04,
            payload: Bytes::new(),
        };
        let _ = router.request_backend(5, req.clone()).await;
        assert_eq!(router.backends.read().await.len(), 1);

        router.reload().await;
        assert!(router.backends.read().await.is_empty());

        // The next request lazily re-creates the backend.
        let _ = router.request_backend(5, req).await;
        assert_eq!(router.backends.read().await.len(), 1);
    }
}
